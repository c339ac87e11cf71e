#![allow(dead_code)]

use std::sync::{Arc, Once};

use fiberloom::{Config, FifoScheduler};
use stackarena::{Arena, LocaleArena};

static INIT_LOGGING: Once = Once::new();

/// Routes `tracing` output through the test harness. Only the first call does anything.
pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .with_target(true)
            .with_ansi(false)
            .try_init();
    });
}

/// A scheduler plus a handle on its arena, so tests can check what is still allocated.
pub fn scheduler_with(config: Config) -> (Box<FifoScheduler>, Arc<LocaleArena>) {
    init_test_logging();
    let arena = Arc::new(LocaleArena::new());
    let shared: Arc<dyn Arena> = arena.clone();
    let scheduler = FifoScheduler::new(config, shared).expect("valid test config");
    (scheduler, arena)
}

pub fn scheduler() -> (Box<FifoScheduler>, Arc<LocaleArena>) {
    scheduler_with(Config::default())
}

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

pub fn is_protection_fault(exit: &ChildExit) -> bool {
    matches!(exit, ChildExit::Signal(libc::SIGSEGV) | ChildExit::Signal(libc::SIGBUS))
}
