use crate::session::{WindowControl, WindowHandle};
use windows::core::BOOL;
use windows::Win32::Foundation::{HWND, LPARAM};
use windows::Win32::UI::WindowsAndMessaging::{
    EnumWindows, GetWindow, GetWindowThreadProcessId, IsIconic, IsWindowVisible, SetForegroundWindow, ShowWindow,
    GW_OWNER, SW_RESTORE,
};

/// Top-level window lookup and focus through user32.
pub struct DesktopWindows;

struct Search {
    pid: u32,
    found: Option<HWND>,
}

unsafe extern "system" fn match_window(hwnd: HWND, lparam: LPARAM) -> BOOL {
    let search = &mut *(lparam.0 as *mut Search);
    let mut owner_pid = 0u32;
    GetWindowThreadProcessId(hwnd, Some(&mut owner_pid));
    // Owned windows are dialogs and tool windows, not the main one
    let unowned = GetWindow(hwnd, GW_OWNER).map_or(true, |owner| owner.is_invalid());
    if owner_pid == search.pid && unowned && IsWindowVisible(hwnd).as_bool() {
        search.found = Some(hwnd);
        return false.into();
    }
    true.into()
}

fn hwnd(window: WindowHandle) -> HWND {
    HWND(window as *mut _)
}

impl WindowControl for DesktopWindows {
    fn main_window(&self, pid: u32) -> Option<WindowHandle> {
        let mut search = Search { pid, found: None };
        unsafe {
            // Returns an error when the callback stops enumeration early
            let _ = EnumWindows(Some(match_window), LPARAM(&mut search as *mut Search as isize));
        }
        search.found.map(|h| h.0 as WindowHandle)
    }

    fn is_minimized(&self, window: WindowHandle) -> bool {
        unsafe { IsIconic(hwnd(window)).as_bool() }
    }

    fn restore(&self, window: WindowHandle) -> bool {
        unsafe {
            let _ = ShowWindow(hwnd(window), SW_RESTORE);
            !IsIconic(hwnd(window)).as_bool()
        }
    }

    fn bring_to_front(&self, window: WindowHandle) -> bool {
        unsafe { SetForegroundWindow(hwnd(window)).as_bool() }
    }
}
