//! An on-demand (lazily paged) loader for statically linked ELF64
//! executables.
//!
//! Rather than eagerly mapping every loadable segment when the child
//! program starts, [`init`] installs a `SIGSEGV` handler and [`execute`]
//! materialises one page at a time as the target program touches it,
//! drawing content from the file image or zero-filled anonymous memory
//! according to the segment's layout (see [`fault`] for the paging policy).
//!
//! ```no_run
//! demand_loader::init().expect("failed to install fault handler");
//! demand_loader::execute("/bin/echo", &["/bin/echo".into(), "hi".into()])
//!     .expect("failed to launch target");
//! ```

pub mod elf;
pub mod error;
pub mod fault;
pub mod registry;
pub mod segment;
pub mod trampoline;

pub use error::LoaderError;

/// Architectural page size. 4096 on the reference platform (spec.md §3).
pub const PAGE: usize = 4096;

/// Installs the `SIGSEGV` fault handler (spec.md §6, loader API). Must be
/// called once, before [`execute`]. Calling it twice is undefined, matching
/// the teacher's and the original source's single-shot lifecycle.
pub fn init() -> Result<(), LoaderError> {
    use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

    let handler = SigHandler::SigAction(fault::handle_segv);
    let action = SigAction::new(handler, SaFlags::SA_SIGINFO, SigSet::empty());

    // Safety: `handle_segv` only touches the process-wide `LoaderContext`
    // and raw libc calls documented as signal-safe in `fault`.
    unsafe { sigaction(Signal::SIGSEGV, &action) }?;
    Ok(())
}

/// Parses `path`, installs the segment table and page registry, then jumps
/// to the target's entry point via the trampoline (spec.md §4.5).
///
/// On success this does not return: the trampoline transfers control to
/// the target program, which controls its own exit. On an open failure,
/// this function terminates the process with exit status 1 directly
/// (spec.md §7 item 3) rather than returning an error, matching the
/// original source's behaviour.
pub fn execute(path: &str, argv: &[String]) -> Result<std::convert::Infallible, LoaderError> {
    use std::fs::File;
    use std::os::unix::io::AsRawFd;

    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(_) => {
            eprintln!("Could not open the executable...");
            std::process::exit(1);
        }
    };
    let image = elf::parse_file(&mut file)?;

    let fd = file.as_raw_fd();
    // The file descriptor must remain open and stable for the entire
    // lifetime of the child program (spec.md §4.5): leak the `File` so its
    // `Drop` never closes `fd` out from under the fault handler's
    // file-backed mappings.
    std::mem::forget(file);

    fault::install(fd, image.segments);

    // Safety: `image.entry` comes from a validated ELF header and the
    // segments that back it have just been installed as the active loader
    // context.
    unsafe { trampoline::start(image.entry, argv) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_is_4096() {
        assert_eq!(PAGE, 4096);
    }
}
