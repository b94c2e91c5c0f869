/// Entry point for the pmctl binary
/// Everything lives in the library crate; this only guards against panics
fn main() {
    // Report panics on stderr and exit non-zero
    // stdout is reserved for the JSON answer, so nothing half-written goes there
    std::panic::set_hook(Box::new(|panic_info| {
        eprintln!("pmctl panic: {}", panic_info);
        std::process::exit(1);
    }));

    // Delegate to the library crate where config, logging and dispatch live
    // Errors reaching this point are outer-surface ones (unknown project, bad store, spawn)
    if let Err(e) = pmctl_lib::run() {
        eprintln!("pmctl: {:#}", e);
        std::process::exit(1);
    }
}
