//! Win32 window hosting the swap chain.

use std::cell::Cell;

use tracing::debug;
use widestring::U16CString;
use windows::core::w;
use windows::core::Result;
use windows::core::PCWSTR;
use windows::Win32::Foundation::*;
use windows::Win32::System::LibraryLoader::GetModuleHandleW;
use windows::Win32::UI::WindowsAndMessaging::*;

const CLASS_NAME: PCWSTR = w!("Dx12FrameLoopWindow");
const VK_V: usize = 0x56;

/// Input gathered by the window procedure since the last
/// [`Window::take_events`].
#[derive(Debug, Default)]
pub struct WindowEvents {
    resize: Cell<Option<(u32, u32)>>,
    toggle_vsync: Cell<bool>,
    destroyed: Cell<bool>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingEvents {
    /// Latest non-zero client size reported by `WM_SIZE`.
    pub resize: Option<(u32, u32)>,
    pub toggle_vsync: bool,
}

pub struct Window {
    pub hwnd: HWND,
    events: Box<WindowEvents>,
}

impl Window {
    /// Registers the window class and creates an overlapped window whose
    /// client area is `width` x `height`.
    pub fn create(title: &str, width: u32, height: u32) -> Result<Self> {
        let instance = unsafe { GetModuleHandleW(None)? };

        let wc = WNDCLASSEXW {
            cbSize: std::mem::size_of::<WNDCLASSEXW>() as u32,
            style: CS_HREDRAW | CS_VREDRAW,
            lpfnWndProc: Some(wndproc),
            hInstance: instance.into(),
            hCursor: unsafe { LoadCursorW(None, IDC_ARROW)? },
            lpszClassName: CLASS_NAME,
            ..Default::default()
        };
        let atom = unsafe { RegisterClassExW(&wc) };
        if atom == 0 {
            return Err(unsafe { GetLastError() }.to_hresult().into());
        }

        let mut window_rect = RECT {
            left: 0,
            top: 0,
            right: width as i32,
            bottom: height as i32,
        };
        // Outer size for the requested client size.
        unsafe { AdjustWindowRect(&mut window_rect, WS_OVERLAPPEDWINDOW, false)? };

        let title = U16CString::from_str_truncate(title);
        let events = Box::<WindowEvents>::default();
        let hwnd = unsafe {
            CreateWindowExW(
                WINDOW_EX_STYLE::default(),
                CLASS_NAME,
                PCWSTR(title.as_ptr()),
                WS_OVERLAPPEDWINDOW,
                CW_USEDEFAULT,
                CW_USEDEFAULT,
                window_rect.right - window_rect.left,
                window_rect.bottom - window_rect.top,
                None,
                None,
                Some(instance.into()),
                Some(&*events as *const WindowEvents as _),
            )
        }?;

        debug!(width, height, "Window created");
        Ok(Self { hwnd, events })
    }

    pub fn show(&self) {
        unsafe { _ = ShowWindow(self.hwnd, SW_SHOW) };
    }

    pub fn take_events(&self) -> PendingEvents {
        PendingEvents {
            resize: self.events.resize.take(),
            toggle_vsync: self.events.toggle_vsync.take(),
        }
    }
}

impl Drop for Window {
    fn drop(&mut self) {
        if !self.events.destroyed.get() {
            unsafe { _ = DestroyWindow(self.hwnd) };
        }
    }
}

/// Drains the thread's message queue. Returns `false` once `WM_QUIT` is seen.
pub fn pump_messages() -> bool {
    let mut message = MSG::default();
    while unsafe { PeekMessageW(&mut message, None, 0, 0, PM_REMOVE) }.into() {
        if message.message == WM_QUIT {
            return false;
        }
        unsafe {
            _ = TranslateMessage(&message);
            DispatchMessageW(&message);
        }
    }
    true
}

extern "system" fn wndproc(window: HWND, message: u32, wparam: WPARAM, lparam: LPARAM) -> LRESULT {
    if message == WM_CREATE {
        unsafe {
            let create_struct: &CREATESTRUCTW = &*(lparam.0 as *const CREATESTRUCTW);
            SetWindowLongPtrW(window, GWLP_USERDATA, create_struct.lpCreateParams as _);
        }
        return LRESULT(0);
    }

    let user_data = unsafe { GetWindowLongPtrW(window, GWLP_USERDATA) };
    if user_data == 0 {
        // Messages can arrive before WM_CREATE and after WM_NCDESTROY.
        return unsafe { DefWindowProcW(window, message, wparam, lparam) };
    }
    let events = unsafe { &*(user_data as *const WindowEvents) };

    match message {
        WM_SIZE => {
            let width = (lparam.0 as u32) & 0xFFFF;
            let height = ((lparam.0 as u32) >> 16) & 0xFFFF;
            if width != 0 && height != 0 {
                events.resize.set(Some((width, height)));
            }
            LRESULT(0)
        }
        WM_KEYUP if wparam.0 == VK_V => {
            events.toggle_vsync.set(true);
            LRESULT(0)
        }
        WM_DESTROY => {
            unsafe { PostQuitMessage(0) };
            LRESULT(0)
        }
        WM_NCDESTROY => {
            events.destroyed.set(true);
            unsafe { SetWindowLongPtrW(window, GWLP_USERDATA, 0) };
            unsafe { DefWindowProcW(window, message, wparam, lparam) }
        }
        _ => unsafe { DefWindowProcW(window, message, wparam, lparam) },
    }
}
