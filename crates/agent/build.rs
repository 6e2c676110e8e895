#[cfg(windows)]
fn main() {
    let mut res = winres::WindowsResource::new();
    res.set("ProductName", "FrameHook");
    res.set("FileDescription", "FrameHook Agent - in-process capture and overlay");
    res.set("LegalCopyright", "© 2025 FrameHook Contributors");
    res.set("CompanyName", "FrameHook");
    res.set("OriginalFilename", "framehook_agent.dll");

    if let Err(e) = res.compile() {
        eprintln!("Failed to compile Windows resource: {}", e);
    }
}

#[cfg(not(windows))]
fn main() {
    // No-op on non-Windows platforms
}
