#![allow(dead_code)]

/// How a forked child ended.
#[derive(Debug, PartialEq, Eq)]
pub enum ChildExit {
    Code(i32),
    Signal(i32),
}

/// Runs `f` in a forked child and reports how the child terminated. The child exits
/// with status 0 if `f` returns.
pub fn in_child<F: FnOnce()>(f: F) -> ChildExit {
    unsafe {
        match libc::fork() {
            -1 => panic!("fork failed: {}", std::io::Error::last_os_error()),
            0 => {
                f();
                libc::_exit(0);
            }
            pid => {
                let mut status = 0;
                assert_eq!(libc::waitpid(pid, &mut status, 0), pid);
                if libc::WIFSIGNALED(status) {
                    ChildExit::Signal(libc::WTERMSIG(status))
                } else {
                    ChildExit::Code(libc::WEXITSTATUS(status))
                }
            }
        }
    }
}

/// Guard page hits show up as SIGSEGV on Linux and SIGBUS on Darwin.
pub fn is_protection_fault(exit: &ChildExit) -> bool {
    matches!(exit, ChildExit::Signal(libc::SIGSEGV) | ChildExit::Signal(libc::SIGBUS))
}
