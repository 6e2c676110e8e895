#[cfg(windows)]
fn main() {
    let mut res = winres::WindowsResource::new();
    res.set("ProductName", "FrameHook");
    res.set("FileDescription", "FrameHook Controller - attach, capture and overlay");
    res.set("LegalCopyright", "© 2025 FrameHook Contributors");
    res.set("CompanyName", "FrameHook");
    res.set("OriginalFilename", "framehook.exe");

    if let Err(e) = res.compile() {
        eprintln!("Failed to compile Windows resource: {}", e);
    }
}

#[cfg(not(windows))]
fn main() {
    // No-op on non-Windows platforms
}
