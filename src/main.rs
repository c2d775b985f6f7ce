// TrayDock — a host-controlled button docked into the Windows taskbar
// Copyright (C) 2026  TrayDock contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::mem;
use std::os::windows::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicU32, Ordering::SeqCst};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;
use windows::core::*;
use windows::Win32::Foundation::*;
use windows::Win32::Graphics::Gdi::*;
use windows::Win32::System::DataExchange::COPYDATASTRUCT;
use windows::Win32::System::LibraryLoader::GetModuleHandleW;
use windows::Win32::UI::Accessibility::{HCF_HIGHCONTRASTON, HIGHCONTRASTW};
use windows::Win32::UI::Controls::{
    TTF_SUBCLASS, TTM_ADDTOOLW, TTM_UPDATETIPTEXTW, TTS_ALWAYSTIP, TTS_BALLOON, TTTOOLINFOW,
    TTS_NOPREFIX,
};
use windows::Win32::UI::HiDpi::GetDpiForWindow;
use windows::Win32::UI::Input::KeyboardAndMouse::{TrackMouseEvent, TME_LEAVE, TRACKMOUSEEVENT};
use windows::Win32::UI::WindowsAndMessaging::*;

// ── Identity ────────────────────────────────────────
const BUTTON_CLASS: PCWSTR = w!("TrayDock-Button");
const HOST_WINDOW_CLASS: PCWSTR = w!("traydock-host-window");
const BUTTON_MESSAGE_NAME: PCWSTR = w!("TrayDock-Button-Message");
const POSITION_MESSAGE_NAME: PCWSTR = w!("TrayDock-ButtonPos-Message");
const SHELL_HOOK_NAME: PCWSTR = w!("SHELLHOOK");

// ── Dimensionen ─────────────────────────────────────
const ICON_SIZE: i32 = 16; // icon edge at 96 dpi
const BUTTON_SPAN: i32 = 24; // button width at 96 dpi
const BASE_DPI: u32 = 96;
const CREATE_HEIGHT: i32 = 40; // placeholder until the first docking pass

// Overlay levels. Values come from what looks right.
const PRESSED_ALPHA: u8 = 10;
const HOVER_ALPHA: u8 = 25;

// ── Timer ───────────────────────────────────────────
const TIMER_RESIZE: usize = 1;
const TIMER_CHECK: usize = 2;
const RESIZE_POLL_MS: u32 = 100; // fast re-check while the shell animates
const CHECK_SOON_MS: u32 = 1000;
const CHECK_DELAY_MS: u32 = 5000; // host liveness interval
const SHELL_WAIT_MS: u64 = 1000;
const SHELL_WAIT_WARN_AFTER: u32 = 100;

// ── Host protocol ───────────────────────────────────
// Commands pushed by the host (WM_COPYDATA dwData).
const CMD_SET_ICON: u32 = 1;
const CMD_SET_ICON_HC: u32 = 2;
const CMD_SET_TOOLTIP: u32 = 3;
const CMD_DESTROY: u32 = 4;
const CMD_SET_CHECKED: u32 = 5;

/// Notifications pushed to the host, carried in the wparam of the registered
/// button message.
#[derive(Clone, Copy, Debug)]
enum HostNotice {
    UpdateRequest = 0,
    Click = 1,
    ShowMenu = 2,
    MouseEnter = 3,
    MouseLeave = 4,
}

/// A host command, decoded once at the protocol boundary.
#[derive(Clone, Debug, PartialEq)]
enum HostCommand {
    SetIcon(PathBuf),
    SetIconHighContrast(PathBuf),
    SetTooltip(String),
    SetChecked(bool),
    Destroy,
}

impl HostCommand {
    fn decode(id: u32, text: &str) -> Option<Self> {
        match id {
            CMD_SET_ICON => Some(Self::SetIcon(PathBuf::from(text))),
            CMD_SET_ICON_HC => Some(Self::SetIconHighContrast(PathBuf::from(text))),
            CMD_SET_TOOLTIP => Some(Self::SetTooltip(text.to_string())),
            CMD_DESTROY => Some(Self::Destroy),
            CMD_SET_CHECKED => Some(Self::SetChecked(text.eq_ignore_ascii_case("true"))),
            _ => None,
        }
    }
}

/// The transport does not guarantee the trailing terminator; force one before
/// scanning for it.
fn text_from_units(mut units: Vec<u16>) -> String {
    if let Some(last) = units.last_mut() {
        *last = 0;
    }
    let end = units.iter().position(|&u| u == 0).unwrap_or(0);
    String::from_utf16_lossy(&units[..end])
}

unsafe fn payload_text(data: &COPYDATASTRUCT) -> String {
    if data.lpData.is_null() || data.cbData < 2 {
        return String::new();
    }
    let units = std::slice::from_raw_parts(data.lpData as *const u16, (data.cbData / 2) as usize);
    text_from_units(units.to_vec())
}

/// Pack two coordinates into the 16-bit halves of one message field.
fn pack_pair(lo: i32, hi: i32) -> u32 {
    ((lo as u32) & 0xFFFF) | (((hi as u32) & 0xFFFF) << 16)
}

// ── Interaction state ───────────────────────────────

#[derive(Clone, Copy, Default, PartialEq, Eq, Debug)]
struct ButtonState {
    hover: bool,
    pressed: bool,
    checked: bool,
}

impl ButtonState {
    /// Pointer entered the client area. False if hover was already set.
    fn enter(&mut self) -> bool {
        if self.hover {
            return false;
        }
        self.hover = true;
        true
    }

    /// Pointer left: hover and pressed are cleared unconditionally.
    fn leave(&mut self) {
        self.hover = false;
        self.pressed = false;
    }

    fn press(&mut self) {
        self.pressed = true;
    }

    fn release(&mut self) {
        self.pressed = false;
    }

    fn set_checked(&mut self, on: bool) {
        self.checked = on;
    }
}

// ── Geometrie ───────────────────────────────────────

/// Taskbar orientation, re-derived from the live rectangles on every pass.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Orientation {
    Vertical,
    Horizontal { rtl: bool },
}

/// Convert a 96-dpi baseline length to the given dpi, rounding like MulDiv.
fn scale_for_dpi(value: i32, dpi: u32) -> i32 {
    ((value as i64 * dpi as i64 + BASE_DPI as i64 / 2) / BASE_DPI as i64) as i32
}

fn detect_orientation(
    taskbar: &RECT,
    screen_height: i32,
    tasks: &RECT,
    notify: &RECT,
) -> Orientation {
    if taskbar.top == 0 && taskbar.bottom > screen_height - 10 {
        Orientation::Vertical
    } else {
        // If the notification icons sit left of the task list, the shell is
        // laid out right-to-left.
        Orientation::Horizontal {
            rtl: notify.left < tasks.left,
        }
    }
}

/// Target rectangles of one docking pass, in taskbar client coordinates.
#[derive(Clone, Copy, PartialEq, Debug)]
struct DockLayout {
    tasks: RECT,
    button: RECT,
}

/// Carve one button span out of the task list on the edge adjacent to the
/// notification area. The button fills the carved gap exactly and sits flush
/// with the client bounds on the cross axis, inset by one pixel in
/// high-contrast mode so it stays visible against the themed border.
fn dock_layout(
    tasks: &RECT,
    notify: &RECT,
    client: &RECT,
    orientation: Orientation,
    span: i32,
    inset: i32,
) -> DockLayout {
    let mut tasks = *tasks;
    let mut button = RECT::default();

    match orientation {
        Orientation::Vertical => {
            tasks.bottom = notify.top - span;
            button.top = tasks.bottom;
            button.bottom = notify.top;
            button.left = inset;
            button.right = client.right;
        }
        Orientation::Horizontal { rtl: false } => {
            tasks.right = notify.left - span;
            button.left = tasks.right;
            button.right = notify.left;
            button.top = inset;
            button.bottom = client.bottom;
        }
        Orientation::Horizontal { rtl: true } => {
            // Notification area on the left.
            tasks.left = notify.right + span;
            button.left = notify.right;
            button.right = tasks.left;
            button.top = inset;
            button.bottom = client.bottom;
        }
    }

    DockLayout { tasks, button }
}

// ── Scoped GDI resources ────────────────────────────
// Every paired acquire/release (paint session, memory DC, bitmap, icon) lives
// in a guard so the release happens on every exit path.

struct PaintSession {
    window: HWND,
    ps: PAINTSTRUCT,
    dc: HDC,
}

impl PaintSession {
    unsafe fn begin(window: HWND) -> Option<Self> {
        let mut ps = PAINTSTRUCT::default();
        let dc = BeginPaint(window, &mut ps);
        if dc.is_invalid() {
            return None;
        }
        Some(Self { window, ps, dc })
    }
}

impl Drop for PaintSession {
    fn drop(&mut self) {
        unsafe {
            let _ = EndPaint(self.window, &self.ps);
        }
    }
}

/// A 32-bit top-down DIB selected into a memory DC, with direct pixel access.
struct Canvas {
    dc: HDC,
    bitmap: HBITMAP,
    old: HGDIOBJ,
    bits: *mut u32,
    len: usize,
}

impl Canvas {
    unsafe fn new(reference: HDC, width: i32, height: i32) -> Option<Self> {
        if width <= 0 || height <= 0 {
            return None;
        }
        let bmi = BITMAPINFO {
            bmiHeader: BITMAPINFOHEADER {
                biSize: mem::size_of::<BITMAPINFOHEADER>() as u32,
                biWidth: width,
                biHeight: -height, // top-down
                biPlanes: 1,
                biBitCount: 32,
                biCompression: 0, // BI_RGB
                ..Default::default()
            },
            ..Default::default()
        };
        let dc = CreateCompatibleDC(reference);
        let mut bits: *mut core::ffi::c_void = std::ptr::null_mut();
        let bitmap = match CreateDIBSection(dc, &bmi, DIB_RGB_COLORS, &mut bits, None, 0) {
            Ok(bitmap) => bitmap,
            Err(e) => {
                error!("CreateDIBSection failed: {e}");
                let _ = DeleteDC(dc);
                return None;
            }
        };
        if bits.is_null() {
            let _ = DeleteObject(bitmap);
            let _ = DeleteDC(dc);
            return None;
        }
        let old = SelectObject(dc, bitmap);
        Some(Self {
            dc,
            bitmap,
            old,
            bits: bits as *mut u32,
            len: (width * height) as usize,
        })
    }

    unsafe fn pixels(&mut self) -> &mut [u32] {
        std::slice::from_raw_parts_mut(self.bits, self.len)
    }
}

impl Drop for Canvas {
    fn drop(&mut self) {
        unsafe {
            SelectObject(self.dc, self.old);
            let _ = DeleteObject(self.bitmap);
            let _ = DeleteDC(self.dc);
        }
    }
}

/// An owned rasterized icon; exactly one alive at a time.
struct IconResource {
    handle: HICON,
    path: PathBuf,
    size: i32,
}

impl IconResource {
    unsafe fn load(path: &Path, size: i32) -> Option<Self> {
        let wide: Vec<u16> = path.as_os_str().encode_wide().chain(Some(0)).collect();
        match LoadImageW(None, PCWSTR(wide.as_ptr()), IMAGE_ICON, size, size, LR_LOADFROMFILE) {
            Ok(handle) => Some(Self {
                handle: HICON(handle.0),
                path: path.to_path_buf(),
                size,
            }),
            Err(e) => {
                error!("LoadImageW {} failed: {e}", path.display());
                None
            }
        }
    }
}

impl Drop for IconResource {
    fn drop(&mut self) {
        unsafe {
            let _ = DestroyIcon(self.handle);
        }
    }
}

// ── High-contrast remap ─────────────────────────────
// DIB words are 0xAARRGGBB.
const OPAQUE_BLACK: u32 = 0xFF00_0000;
const OPAQUE_WHITE: u32 = 0xFFFF_FFFF;

/// COLORREF (0x00BBGGRR) to DIB channel order (0x00RRGGBB).
fn colorref_to_rgb(color: u32) -> u32 {
    ((color & 0xFF) << 16) | (color & 0xFF00) | ((color >> 16) & 0xFF)
}

/// Remap one icon pixel onto the theme colors. Pure black and white map to
/// background and foreground exactly; anything else is read as a grayscale
/// level and interpolated per channel, which keeps anti-aliased edges smooth
/// against the themed background.
fn theme_tint(pixel: u32, fore: u32, back: u32) -> u32 {
    match pixel {
        OPAQUE_BLACK => back,
        OPAQUE_WHITE => fore,
        _ => {
            let a = (pixel & 0xFF) as f64 / 255.0;
            let mix = |f: u32, b: u32| (f as f64 * a + b as f64 * (1.0 - a)).round() as u32;
            let r = mix((fore >> 16) & 0xFF, (back >> 16) & 0xFF);
            let g = mix((fore >> 8) & 0xFF, (back >> 8) & 0xFF);
            let b = mix(fore & 0xFF, back & 0xFF);
            (r << 16) | (g << 8) | b
        }
    }
}

// ── Button context ──────────────────────────────────

/// All mutable process state, owned by the message-loop thread. Handles never
/// leave that thread; Send is asserted only so the context can live in a
/// static.
struct ButtonContext {
    window: HWND,
    tooltip: HWND,
    host: HWND,
    state: ButtonState,
    dpi: u32,
    icon_size: i32,
    high_contrast: bool,
    icon: Option<IconResource>,
    icon_path: Option<PathBuf>,
    icon_path_hc: Option<PathBuf>,
    tasks_rect: RECT,
    notify_rect: RECT,
    client_rect: RECT,
    reported_rect: RECT,
    die: bool,
}

unsafe impl Send for ButtonContext {}

impl ButtonContext {
    fn new() -> Self {
        Self {
            window: HWND::default(),
            tooltip: HWND::default(),
            host: HWND::default(),
            state: ButtonState::default(),
            dpi: 0,
            icon_size: ICON_SIZE,
            high_contrast: false,
            icon: None,
            icon_path: None,
            icon_path_hc: None,
            tasks_rect: RECT::default(),
            notify_rect: RECT::default(),
            client_rect: RECT::default(),
            reported_rect: RECT::default(),
            die: false,
        }
    }

    /// The icon source for the current contrast mode.
    fn icon_source(&self) -> Option<&PathBuf> {
        if self.high_contrast {
            self.icon_path_hc.as_ref().or(self.icon_path.as_ref())
        } else {
            self.icon_path.as_ref()
        }
    }
}

static CONTEXT: Mutex<Option<ButtonContext>> = Mutex::new(None);

/// Run `f` against the context. Re-entrant window messages (sent back to us
/// from inside our own SetWindowPos calls) find the lock taken and are
/// skipped; the resize timer re-runs the layout shortly after, so nothing is
/// lost.
fn with_context<R>(f: impl FnOnce(&mut ButtonContext) -> R) -> Option<R> {
    let mut guard = CONTEXT.try_lock().ok()?;
    guard.as_mut().map(f)
}

// Message ids registered with the system at startup, fixed afterwards.
static BUTTON_MSG: AtomicU32 = AtomicU32::new(0);
static POSITION_MSG: AtomicU32 = AtomicU32::new(0);
static SHELL_HOOK_MSG: AtomicU32 = AtomicU32::new(0);

fn button_msg() -> u32 {
    BUTTON_MSG.load(SeqCst)
}

fn position_msg() -> u32 {
    POSITION_MSG.load(SeqCst)
}

fn shell_hook_msg() -> u32 {
    SHELL_HOOK_MSG.load(SeqCst)
}

// ── Host messaging ──────────────────────────────────

/// Revalidate the cached host handle, re-resolving by class name when it went
/// stale. The host is looked up, never owned.
unsafe fn resolve_host(ctx: &mut ButtonContext) -> Option<HWND> {
    if !ctx.host.is_invalid() && IsWindow(ctx.host).as_bool() {
        return Some(ctx.host);
    }
    match FindWindowW(HOST_WINDOW_CLASS, None) {
        Ok(found) if !found.is_invalid() => {
            ctx.host = found;
            Some(found)
        }
        _ => {
            ctx.host = HWND::default();
            warn!("host window not found");
            None
        }
    }
}

/// Fire-and-forget send. Peer absence is a normal condition, not an error.
unsafe fn send_to_host(ctx: &mut ButtonContext, msg: u32, wparam: usize, lparam: isize) -> bool {
    debug!(msg, wparam, lparam, "send to host");
    match resolve_host(ctx) {
        Some(host) => {
            let _ = SendNotifyMessageW(host, msg, WPARAM(wparam), LPARAM(lparam));
            true
        }
        None => false,
    }
}

unsafe fn notify_host(ctx: &mut ButtonContext, notice: HostNotice) -> bool {
    send_to_host(ctx, button_msg(), notice as usize, 0)
}

/// Tell the host where the button ended up, once per actual move.
unsafe fn report_position(ctx: &mut ButtonContext, rect: RECT) {
    if rect == ctx.reported_rect {
        return;
    }
    ctx.reported_rect = rect;
    let origin = pack_pair(rect.left, rect.top);
    let size = pack_pair(rect.right - rect.left, rect.bottom - rect.top);
    send_to_host(ctx, position_msg(), origin as usize, size as isize);
}

// ── Shell window tree ───────────────────────────────

unsafe fn taskbar_window() -> Option<HWND> {
    FindWindowW(w!("Shell_TrayWnd"), None)
        .ok()
        .filter(|h| !h.is_invalid())
}

unsafe fn window_dpi(window: HWND, fallback: u32) -> u32 {
    let dpi = GetDpiForWindow(window);
    if dpi != 0 {
        dpi
    } else if fallback != 0 {
        fallback
    } else {
        BASE_DPI
    }
}

unsafe fn window_rect(window: HWND) -> Option<RECT> {
    let mut rect = RECT::default();
    GetWindowRect(window, &mut rect).ok().map(|_| rect)
}

unsafe fn screen_to_client(reference: HWND, rect: RECT) -> RECT {
    let mut points = [
        POINT {
            x: rect.left,
            y: rect.top,
        },
        POINT {
            x: rect.right,
            y: rect.bottom,
        },
    ];
    MapWindowPoints(HWND::default(), reference, &mut points);
    RECT {
        left: points[0].x,
        top: points[0].y,
        right: points[1].x,
        bottom: points[1].y,
    }
}

unsafe fn request_redraw(window: HWND) {
    let _ = RedrawWindow(
        window,
        None,
        None,
        RDW_ERASE | RDW_INVALIDATE | RDW_FRAME | RDW_ALLCHILDREN,
    );
}

// ── Docking engine ──────────────────────────────────

/// Hide and orphan the button: the host is gone, give the space back.
unsafe fn hide_button(ctx: &mut ButtonContext) {
    if !IsWindow(ctx.host).as_bool() {
        ctx.host = HWND::default();
    }

    ctx.icon_path = None;
    ctx.icon = None;

    if IsWindow(ctx.window).as_bool() {
        let _ = ShowWindow(ctx.window, SW_HIDE);
    }

    if let Some(taskbar) = taskbar_window() {
        // Nudge the taskbar so it reflows over the vacated gap.
        let _ = SendNotifyMessageW(taskbar, WM_ENTERSIZEMOVE, WPARAM(0), LPARAM(0));
        let _ = SendNotifyMessageW(taskbar, WM_EXITSIZEMOVE, WPARAM(0), LPARAM(0));
    }
}

/// One docking pass: read the live shell geometry, recompute the button's
/// target rectangle and apply it when something moved.
///
/// Returns true when a change was detected or forced.
unsafe fn reconcile(ctx: &mut ButtonContext, force: bool) -> bool {
    debug!(force, "reconcile");

    if ctx.window.is_invalid() {
        return false;
    }
    if !IsWindow(ctx.host).as_bool() {
        hide_button(ctx);
    }
    if ctx.icon.is_none() {
        return false;
    }

    let Some(taskbar) = taskbar_window() else {
        return false;
    };
    let Ok(tasks) = FindWindowExW(taskbar, None, w!("ReBarWindow32"), None) else {
        debug!("task list window not found");
        return false;
    };
    let Ok(notify) = FindWindowExW(taskbar, None, w!("TrayNotifyWnd"), None) else {
        debug!("notification window not found");
        return false;
    };

    // A scale change invalidates the icon; the rebuild re-enters the layout.
    let dpi = window_dpi(taskbar, ctx.dpi);
    if dpi != ctx.dpi {
        info!(old = ctx.dpi, new = dpi, "display scale changed");
        ctx.dpi = dpi;
        rebuild_icon(ctx);
        return true;
    }

    let Some(tasks_screen) = window_rect(tasks) else {
        return false;
    };
    let Some(notify_screen) = window_rect(notify) else {
        return false;
    };
    let Some(taskbar_screen) = window_rect(taskbar) else {
        return false;
    };
    let mut client = RECT::default();
    let _ = GetClientRect(taskbar, &mut client);

    let new_tasks = screen_to_client(taskbar, tasks_screen);
    let new_notify = screen_to_client(taskbar, notify_screen);

    let mut changed = new_tasks != ctx.tasks_rect
        || new_notify != ctx.notify_rect
        || client != ctx.client_rect;

    let orientation = detect_orientation(
        &taskbar_screen,
        GetSystemMetrics(SM_CYFULLSCREEN),
        &new_tasks,
        &new_notify,
    );
    let layout = dock_layout(
        &new_tasks,
        &new_notify,
        &client,
        orientation,
        scale_for_dpi(BUTTON_SPAN, ctx.dpi),
        if ctx.high_contrast { 1 } else { 0 },
    );

    // Cache the shrunk task rect: once the shell has applied the resize the
    // next read matches it and the comparison settles.
    ctx.tasks_rect = layout.tasks;
    ctx.notify_rect = new_notify;
    ctx.client_rect = client;

    if !force || !changed {
        // The shell may have moved just the button.
        if let Some(current) = window_rect(ctx.window) {
            let current = screen_to_client(taskbar, current);
            changed = changed || current != layout.button;
        }
    }

    if force || changed {
        // Size-only shrink of the task list, then slot the button into the
        // carved gap.
        let _ = SetWindowPos(
            tasks,
            HWND_BOTTOM,
            0,
            0,
            layout.tasks.right - layout.tasks.left,
            layout.tasks.bottom - layout.tasks.top,
            SWP_NOACTIVATE | SWP_NOMOVE,
        );
        let _ = SetWindowPos(
            ctx.window,
            HWND_TOP,
            layout.button.left,
            layout.button.top,
            layout.button.right - layout.button.left,
            layout.button.bottom - layout.button.top,
            SWP_NOACTIVATE | SWP_SHOWWINDOW,
        );
        request_redraw(ctx.window);

        // The shell animates its layout; keep checking until it settles.
        let _ = SetTimer(ctx.window, TIMER_RESIZE, RESIZE_POLL_MS, None);
        let _ = SetTimer(ctx.window, TIMER_CHECK, CHECK_SOON_MS, None);
    } else {
        let _ = KillTimer(ctx.window, TIMER_RESIZE);
    }

    if changed {
        if let Some(absolute) = window_rect(ctx.window) {
            report_position(ctx, absolute);
        }
    }

    changed
}

// ── Icon management ─────────────────────────────────

/// Reload the rasterized icon from the stored source paths at the current
/// size and contrast mode, then force a docking pass.
unsafe fn rebuild_icon(ctx: &mut ButtonContext) {
    ctx.icon = None;
    ctx.icon_size = scale_for_dpi(ICON_SIZE, ctx.dpi);

    if ctx.icon_size > 0 {
        if let Some(path) = ctx.icon_source().cloned() {
            ctx.icon = IconResource::load(&path, ctx.icon_size);
        }
    }
    if let Some(icon) = &ctx.icon {
        debug!(size = icon.size, "icon ready: {}", icon.path.display());
    }

    reconcile(ctx, true);
}

/// Query the system high-contrast flag. Returns true when it changed.
unsafe fn refresh_high_contrast(ctx: &mut ButtonContext) -> bool {
    let mut hc = HIGHCONTRASTW {
        cbSize: mem::size_of::<HIGHCONTRASTW>() as u32,
        ..Default::default()
    };
    let _ = SystemParametersInfoW(
        SPI_GETHIGHCONTRAST,
        hc.cbSize,
        Some(&mut hc as *mut _ as *mut _),
        SYSTEM_PARAMETERS_INFO_UPDATE_FLAGS(0),
    );
    let active = hc.dwFlags.contains(HCF_HIGHCONTRASTON);
    let changed = active != ctx.high_contrast;
    ctx.high_contrast = active;
    changed
}

// ── Render pipeline ─────────────────────────────────

/// Fill a rectangle with a translucent color. GDI has no notion of
/// semi-transparent pixels outside AlphaBlend, so stretch a single
/// premultiplied pixel over the target.
unsafe fn alpha_fill(dc: HDC, rect: &RECT, color: u32, alpha: u8) {
    let Some(mut pixel) = Canvas::new(dc, 1, 1) else {
        return;
    };
    let a = alpha as u32;
    pixel.pixels()[0] = (a << 24)
        | ((a * ((color >> 16) & 0xFF) / 0xFF) << 16)
        | ((a * ((color >> 8) & 0xFF) / 0xFF) << 8)
        | (a * (color & 0xFF) / 0xFF);

    let blend = BLENDFUNCTION {
        BlendOp: AC_SRC_OVER as u8,
        BlendFlags: 0,
        SourceConstantAlpha: 255,
        AlphaFormat: AC_SRC_ALPHA as u8,
    };
    let _ = GdiAlphaBlend(
        dc,
        rect.left,
        rect.top,
        rect.right - rect.left,
        rect.bottom - rect.top,
        pixel.dc,
        0,
        0,
        1,
        1,
        blend,
    );
}

/// Draw the button into an off-screen buffer and commit it in one blit.
/// Rendering is a pure function of state, icon and theme; it never mutates
/// the context.
unsafe fn paint(ctx: &ButtonContext) {
    let Some(session) = PaintSession::begin(ctx.window) else {
        return;
    };
    let mut rc = RECT::default();
    let _ = GetClientRect(ctx.window, &mut rc);
    let (width, height) = (rc.right, rc.bottom);

    let Some(mut back) = Canvas::new(session.dc, width, height) else {
        return;
    };

    if ctx.high_contrast {
        let mut back_index = COLOR_WINDOW;
        let mut fore_index = COLOR_WINDOWTEXT;
        if ctx.state.checked {
            fore_index = COLOR_HIGHLIGHT;
        }
        if ctx.state.hover {
            back_index = COLOR_HOTLIGHT;
            fore_index = COLOR_HIGHLIGHTTEXT;
        }
        let back_color = colorref_to_rgb(GetSysColor(back_index));
        let fore_color = colorref_to_rgb(GetSysColor(fore_index));

        // Draw the icon on opaque black, then tint every pixel to the theme.
        for px in back.pixels().iter_mut() {
            *px = OPAQUE_BLACK;
        }
        if let Some(icon) = &ctx.icon {
            let _ = DrawIconEx(
                back.dc,
                (width - icon.size) / 2,
                (height - icon.size) / 2,
                icon.handle,
                icon.size,
                icon.size,
                0,
                HBRUSH::default(),
                DI_NORMAL,
            );
        }
        for px in back.pixels().iter_mut() {
            *px = theme_tint(*px, fore_color, back_color);
        }
    } else {
        let alpha = if ctx.state.pressed {
            PRESSED_ALPHA
        } else if ctx.state.hover {
            HOVER_ALPHA
        } else {
            0
        };
        if alpha != 0 {
            alpha_fill(back.dc, &rc, 0xFFFFFF, alpha);
        }
        if let Some(icon) = &ctx.icon {
            let _ = DrawIconEx(
                back.dc,
                (width - icon.size) / 2,
                (height - icon.size) / 2,
                icon.handle,
                icon.size,
                icon.size,
                0,
                HBRUSH::default(),
                DI_NORMAL,
            );
        }
    }

    // One blit; partial draws never reach the screen.
    let _ = BitBlt(session.dc, 0, 0, width, height, back.dc, 0, 0, SRCCOPY);
}

// ── Tooltip ─────────────────────────────────────────

unsafe fn set_tooltip(ctx: &mut ButtonContext, text: &str) {
    let adding = ctx.tooltip.is_invalid();
    if adding {
        match CreateWindowExW(
            WINDOW_EX_STYLE(0),
            w!("tooltips_class32"),
            None,
            WS_POPUP | WINDOW_STYLE(TTS_ALWAYSTIP | TTS_NOPREFIX | TTS_BALLOON),
            0,
            0,
            0,
            0,
            ctx.window,
            None,
            None,
            None,
        ) {
            Ok(window) => ctx.tooltip = window,
            Err(e) => {
                warn!("tooltip window creation failed: {e}");
                return;
            }
        }
    }

    let mut rect = RECT::default();
    let _ = GetClientRect(ctx.window, &mut rect);
    let mut wide: Vec<u16> = text.encode_utf16().chain(Some(0)).collect();
    let info = TTTOOLINFOW {
        cbSize: mem::size_of::<TTTOOLINFOW>() as u32,
        uFlags: TTF_SUBCLASS,
        hwnd: ctx.window,
        rect,
        lpszText: PWSTR(wide.as_mut_ptr()),
        ..Default::default()
    };
    let message = if adding { TTM_ADDTOOLW } else { TTM_UPDATETIPTEXTW };
    let _ = SendMessageW(
        ctx.tooltip,
        message,
        WPARAM(0),
        LPARAM(&info as *const _ as isize),
    );
}

// ── Inbound commands ────────────────────────────────

unsafe fn handle_copydata(data: &COPYDATASTRUCT) {
    let text = payload_text(data);
    let Some(command) = HostCommand::decode(data.dwData as u32, &text) else {
        warn!(id = data.dwData, "unknown host command");
        return;
    };
    debug!(?command, "host command");

    if command == HostCommand::Destroy {
        // Intentional shutdown: record it, then tear down outside the lock so
        // the re-entrant WM_DESTROY can read the flag.
        let window = with_context(|ctx| {
            ctx.die = true;
            ctx.window
        });
        if let Some(window) = window {
            let _ = DestroyWindow(window);
        }
        PostQuitMessage(0);
        return;
    }

    with_context(|ctx| {
        // The host just spoke; refresh the link to it.
        resolve_host(ctx);
        match command {
            HostCommand::SetIcon(path) => {
                ctx.icon_path = Some(path);
                rebuild_icon(ctx);
            }
            HostCommand::SetIconHighContrast(path) => {
                ctx.icon_path_hc = Some(path);
                rebuild_icon(ctx);
            }
            HostCommand::SetTooltip(text) => set_tooltip(ctx, &text),
            HostCommand::SetChecked(on) => {
                ctx.state.set_checked(on);
                request_redraw(ctx.window);
            }
            HostCommand::Destroy => {}
        }
    });
}

// ── Window procedure ────────────────────────────────

unsafe extern "system" fn button_wndproc(hwnd: HWND, msg: u32, wp: WPARAM, lp: LPARAM) -> LRESULT {
    match msg {
        WM_CREATE => {
            debug!("WM_CREATE");
            with_context(|ctx| {
                if ctx.window.is_invalid() {
                    ctx.window = hwnd;
                }
                // Ask the host to push the current icon/tooltip/state.
                notify_host(ctx, HostNotice::UpdateRequest)
            });
        }

        WM_COPYDATA => {
            let data = lp.0 as *const COPYDATASTRUCT;
            match data.as_ref() {
                Some(data) => handle_copydata(data),
                None => warn!("WM_COPYDATA with no payload"),
            }
        }

        WM_MOUSEMOVE => {
            with_context(|ctx| {
                if ctx.state.enter() {
                    notify_host(ctx, HostNotice::MouseEnter);
                    // Find out when the pointer leaves again.
                    let mut track = TRACKMOUSEEVENT {
                        cbSize: mem::size_of::<TRACKMOUSEEVENT>() as u32,
                        dwFlags: TME_LEAVE,
                        hwndTrack: hwnd,
                        ..Default::default()
                    };
                    let _ = TrackMouseEvent(&mut track);
                    request_redraw(ctx.window);
                }
            });
        }

        WM_MOUSELEAVE => {
            with_context(|ctx| {
                notify_host(ctx, HostNotice::MouseLeave);
                ctx.state.leave();
                request_redraw(ctx.window);
            });
        }

        WM_LBUTTONDOWN => {
            with_context(|ctx| {
                ctx.state.press();
                request_redraw(ctx.window);
            });
        }

        WM_LBUTTONUP => {
            with_context(|ctx| {
                // Let the host's popup take focus.
                let _ = SetForegroundWindow(ctx.host);
                notify_host(ctx, HostNotice::Click);
                ctx.state.release();
                request_redraw(ctx.window);
            });
        }

        WM_RBUTTONUP => {
            with_context(|ctx| {
                // Let the host's menu take focus.
                let _ = SetForegroundWindow(ctx.host);
                notify_host(ctx, HostNotice::ShowMenu)
            });
            return LRESULT(0);
        }

        WM_TIMER => match wp.0 {
            TIMER_CHECK => {
                let host_gone = with_context(|ctx| {
                    if !ctx.host.is_invalid() && !IsWindow(ctx.host).as_bool() {
                        return true;
                    }
                    let _ = SetTimer(ctx.window, TIMER_CHECK, CHECK_DELAY_MS, None);
                    request_redraw(ctx.window);
                    reconcile(ctx, false);
                    false
                })
                .unwrap_or(false);
                if host_gone {
                    info!("host window vanished");
                    PostQuitMessage(1);
                }
            }
            TIMER_RESIZE => {
                with_context(|ctx| reconcile(ctx, false));
            }
            _ => {}
        },

        WM_SIZE | WM_WINDOWPOSCHANGED => {
            with_context(|ctx| reconcile(ctx, true));
        }

        WM_ERASEBKGND => {
            with_context(|ctx| reconcile(ctx, false));
        }

        WM_PAINT => {
            with_context(|ctx| paint(ctx));
        }

        WM_DPICHANGED => {
            with_context(|ctx| {
                // Take the broadcast value, then let the live query correct it.
                ctx.dpi = (wp.0 & 0xFFFF) as u32;
                ctx.dpi = window_dpi(hwnd, ctx.dpi);
                rebuild_icon(ctx);
            });
        }

        WM_SETTINGCHANGE => {
            with_context(|ctx| {
                if refresh_high_contrast(ctx) {
                    // The palette changed under us; the icon needs a reload.
                    rebuild_icon(ctx);
                }
                reconcile(ctx, true);
            });
        }

        WM_DISPLAYCHANGE => {
            with_context(|ctx| reconcile(ctx, true));
        }

        WM_DESTROY | WM_NCDESTROY => {
            let die = with_context(|ctx| ctx.die).unwrap_or(false);
            PostQuitMessage(if die { 0 } else { 1 });
        }

        _ => {
            if msg != 0 && msg == shell_hook_msg() {
                // Shell events usually mean the taskbar laid itself out again.
                let changed = with_context(|ctx| reconcile(ctx, false)).unwrap_or(false);
                if !changed {
                    request_redraw(hwnd);
                }
            }
        }
    }

    DefWindowProcW(hwnd, msg, wp, lp)
}

// ── Lifecycle supervisor ────────────────────────────

/// Wait for the shell to come up. The wait is unbounded; the log is not.
unsafe fn wait_for_taskbar() -> HWND {
    let mut attempts: u32 = 0;
    loop {
        if let Some(taskbar) = taskbar_window() {
            return taskbar;
        }
        attempts += 1;
        if attempts == SHELL_WAIT_WARN_AFTER {
            error!("no taskbar after {attempts} attempts, still waiting");
        }
        thread::sleep(Duration::from_millis(SHELL_WAIT_MS));
    }
}

/// Create the button window as a child of the taskbar, retrying through
/// transient failures (a focused shell UI can deny creation). Logs only when
/// the error code changes, so the retry loop stays quiet.
unsafe fn create_button_window(taskbar: HWND, instance: HINSTANCE) -> HWND {
    let mut last_error = HRESULT(0);
    loop {
        match CreateWindowExW(
            WS_EX_TOOLWINDOW,
            BUTTON_CLASS,
            BUTTON_CLASS,
            WS_VISIBLE | WS_CHILD | WS_CLIPSIBLINGS | WS_TABSTOP,
            0,
            0,
            BUTTON_SPAN,
            CREATE_HEIGHT,
            taskbar,
            None,
            instance,
            None,
        ) {
            Ok(window) => return window,
            Err(e) => {
                if e.code() != last_error {
                    error!("CreateWindowExW failed (retrying): {e}");
                    last_error = e.code();
                }
                thread::sleep(Duration::from_millis(SHELL_WAIT_MS));
            }
        }
    }
}

/// If a previous instance is already docked, tell it to destroy itself and
/// take its place. The old instance may still be winding down when we start.
unsafe fn displace_existing_instance() {
    let Some(taskbar) = taskbar_window() else {
        return;
    };
    let Ok(existing) = FindWindowExW(taskbar, None, BUTTON_CLASS, None) else {
        return;
    };
    if existing.is_invalid() {
        return;
    }
    info!("existing button instance found, asking it to exit");
    let data = COPYDATASTRUCT {
        dwData: CMD_DESTROY as usize,
        cbData: 0,
        lpData: std::ptr::null_mut(),
    };
    let _ = SendMessageW(
        existing,
        WM_COPYDATA,
        WPARAM(0),
        LPARAM(&data as *const _ as isize),
    );
}

unsafe fn run() -> ExitCode {
    BUTTON_MSG.store(RegisterWindowMessageW(BUTTON_MESSAGE_NAME), SeqCst);
    POSITION_MSG.store(RegisterWindowMessageW(POSITION_MESSAGE_NAME), SeqCst);
    SHELL_HOOK_MSG.store(RegisterWindowMessageW(SHELL_HOOK_NAME), SeqCst);

    displace_existing_instance();

    let instance: HINSTANCE = match GetModuleHandleW(None) {
        Ok(module) => module.into(),
        Err(e) => {
            error!("GetModuleHandleW failed: {e}");
            return ExitCode::FAILURE;
        }
    };

    let class = WNDCLASSEXW {
        cbSize: mem::size_of::<WNDCLASSEXW>() as u32,
        lpfnWndProc: Some(button_wndproc),
        hInstance: instance,
        hCursor: LoadCursorW(None, IDC_ARROW).unwrap_or_default(),
        lpszClassName: BUTTON_CLASS,
        ..Default::default()
    };
    if RegisterClassExW(&class) == 0 {
        error!("RegisterClassExW failed");
        return ExitCode::FAILURE;
    }

    *CONTEXT.lock().unwrap() = Some(ButtonContext::new());

    let quit_code = loop {
        let taskbar = wait_for_taskbar();
        info!("taskbar found");

        {
            // Fresh window, fresh interaction state and geometry cache.
            let mut guard = CONTEXT.lock().unwrap();
            if let Some(ctx) = guard.as_mut() {
                ctx.window = HWND::default();
                ctx.tooltip = HWND::default();
                ctx.state = ButtonState::default();
                ctx.tasks_rect = RECT::default();
                ctx.notify_rect = RECT::default();
                ctx.client_rect = RECT::default();
                ctx.reported_rect = RECT::default();
                ctx.dpi = window_dpi(taskbar, BASE_DPI);
                refresh_high_contrast(ctx);
            }
        }

        let window = create_button_window(taskbar, instance);
        info!("button window created");

        let _ = RegisterShellHookWindow(window);
        let _ = SetTimer(window, TIMER_CHECK, CHECK_DELAY_MS, None);

        let mut msg = MSG::default();
        while GetMessageW(&mut msg, None, 0, 0).into() {
            let _ = TranslateMessage(&msg);
            DispatchMessageW(&msg);
        }
        let code = msg.wParam.0;
        info!(code, "message loop ended");

        let die = with_context(|ctx| ctx.die).unwrap_or(true);
        if die {
            break code;
        }
        // Unexpected teardown: the shell may have restarted, go around again.
    };

    with_context(|ctx| hide_button(ctx));
    info!("stopped");

    if quit_code == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    info!("started");
    unsafe { run() }
}

// ── Tests ───────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn rect(left: i32, top: i32, right: i32, bottom: i32) -> RECT {
        RECT {
            left,
            top,
            right,
            bottom,
        }
    }

    fn overlaps(a: &RECT, b: &RECT) -> bool {
        a.left < b.right && b.left < a.right && a.top < b.bottom && b.top < a.bottom
    }

    // ── Docking geometry ────────────────────────────

    #[test]
    fn horizontal_dock_fills_the_carved_gap() {
        let tasks = rect(0, 0, 1740, 40);
        let notify = rect(1750, 0, 1920, 40);
        let client = rect(0, 0, 1920, 40);
        let layout = dock_layout(
            &tasks,
            &notify,
            &client,
            Orientation::Horizontal { rtl: false },
            24,
            0,
        );
        assert_eq!(layout.tasks, rect(0, 0, 1726, 40));
        assert_eq!(layout.button, rect(1726, 0, 1750, 40));
    }

    #[test]
    fn already_docked_layout_is_stable() {
        // The task list already ends one span short of the notification area;
        // recomputing must reproduce both rectangles verbatim.
        let tasks = rect(0, 0, 1726, 40);
        let notify = rect(1750, 0, 1920, 40);
        let client = rect(0, 0, 1920, 40);
        let layout = dock_layout(
            &tasks,
            &notify,
            &client,
            Orientation::Horizontal { rtl: false },
            24,
            0,
        );
        assert_eq!(layout.tasks, tasks);
        assert_eq!(layout.button, rect(1726, 0, 1750, 40));
    }

    #[test]
    fn rtl_dock_carves_the_left_edge() {
        let tasks = rect(200, 0, 1920, 40);
        let notify = rect(0, 0, 170, 40);
        let client = rect(0, 0, 1920, 40);
        let layout = dock_layout(
            &tasks,
            &notify,
            &client,
            Orientation::Horizontal { rtl: true },
            24,
            0,
        );
        assert_eq!(layout.tasks, rect(194, 0, 1920, 40));
        assert_eq!(layout.button, rect(170, 0, 194, 40));
    }

    #[test]
    fn vertical_dock_spans_the_client_width() {
        let tasks = rect(0, 0, 60, 800);
        let notify = rect(0, 900, 60, 1000);
        let client = rect(0, 0, 60, 1000);
        let layout = dock_layout(&tasks, &notify, &client, Orientation::Vertical, 24, 0);
        assert_eq!(layout.tasks, rect(0, 0, 60, 876));
        assert_eq!(layout.button, rect(0, 876, 60, 900));
    }

    #[test]
    fn high_contrast_insets_the_cross_axis_origin() {
        let tasks = rect(0, 0, 1726, 40);
        let notify = rect(1750, 0, 1920, 40);
        let client = rect(0, 0, 1920, 40);
        let plain = dock_layout(
            &tasks,
            &notify,
            &client,
            Orientation::Horizontal { rtl: false },
            24,
            0,
        );
        let contrast = dock_layout(
            &tasks,
            &notify,
            &client,
            Orientation::Horizontal { rtl: false },
            24,
            1,
        );
        assert_eq!(plain.button.top, 0);
        assert_eq!(contrast.button.top, 1);
        assert_eq!(plain.button.left, contrast.button.left);

        let vertical = dock_layout(&tasks, &notify, &client, Orientation::Vertical, 24, 1);
        assert_eq!(vertical.button.left, 1);
    }

    #[test]
    fn button_never_overlaps_either_region() {
        let cases = [
            (
                rect(0, 0, 1700, 40),
                rect(1750, 0, 1920, 40),
                rect(0, 0, 1920, 40),
                Orientation::Horizontal { rtl: false },
            ),
            (
                rect(300, 0, 1920, 48),
                rect(0, 0, 250, 48),
                rect(0, 0, 1920, 48),
                Orientation::Horizontal { rtl: true },
            ),
            (
                rect(0, 0, 62, 700),
                rect(0, 880, 62, 1040),
                rect(0, 0, 62, 1040),
                Orientation::Vertical,
            ),
        ];
        for (tasks, notify, client, orientation) in cases {
            let layout = dock_layout(&tasks, &notify, &client, orientation, 36, 0);
            assert!(!overlaps(&layout.button, &layout.tasks));
            assert!(!overlaps(&layout.button, &notify));
            // The button exactly spans the carved gap on the primary axis.
            match orientation {
                Orientation::Vertical => {
                    assert_eq!(layout.button.top, layout.tasks.bottom);
                    assert_eq!(layout.button.bottom, notify.top);
                }
                Orientation::Horizontal { rtl: false } => {
                    assert_eq!(layout.button.left, layout.tasks.right);
                    assert_eq!(layout.button.right, notify.left);
                }
                Orientation::Horizontal { rtl: true } => {
                    assert_eq!(layout.button.left, notify.right);
                    assert_eq!(layout.button.right, layout.tasks.left);
                }
            }
        }
    }

    #[test]
    fn orientation_follows_the_container_shape() {
        let tasks = rect(0, 0, 100, 100);
        let notify = rect(200, 0, 300, 100);
        // Full-height bar anchored at the top: vertical.
        assert_eq!(
            detect_orientation(&rect(0, 0, 60, 1035), 1040, &tasks, &notify),
            Orientation::Vertical
        );
        // Bottom bar: horizontal.
        assert_eq!(
            detect_orientation(&rect(0, 1040, 1920, 1080), 1040, &tasks, &notify),
            Orientation::Horizontal { rtl: false }
        );
        // Top bar that is only 40px tall: horizontal, not vertical.
        assert_eq!(
            detect_orientation(&rect(0, 0, 1920, 40), 1040, &tasks, &notify),
            Orientation::Horizontal { rtl: false }
        );
    }

    #[test]
    fn reading_direction_compares_left_edges() {
        let bar = rect(0, 1040, 1920, 1080);
        assert_eq!(
            detect_orientation(&bar, 1040, &rect(0, 0, 1700, 40), &rect(1750, 0, 1920, 40)),
            Orientation::Horizontal { rtl: false }
        );
        assert_eq!(
            detect_orientation(&bar, 1040, &rect(200, 0, 1920, 40), &rect(0, 0, 170, 40)),
            Orientation::Horizontal { rtl: true }
        );
    }

    #[test]
    fn dpi_scaling_rounds_like_muldiv() {
        assert_eq!(scale_for_dpi(24, 96), 24);
        assert_eq!(scale_for_dpi(24, 144), 36);
        assert_eq!(scale_for_dpi(16, 120), 20);
        assert_eq!(scale_for_dpi(24, 120), 30);
        // 15 * 144 / 96 = 22.5 rounds up.
        assert_eq!(scale_for_dpi(15, 144), 23);
    }

    // ── High-contrast remap ─────────────────────────

    #[test]
    fn tint_maps_pure_black_and_white_exactly() {
        let fore = 0xFF0000;
        let back = 0x0000FF;
        assert_eq!(theme_tint(OPAQUE_BLACK, fore, back), back);
        assert_eq!(theme_tint(OPAQUE_WHITE, fore, back), fore);
    }

    #[test]
    fn tint_is_linear_in_the_grayscale_level() {
        let fore = 0xFF0000;
        let back = 0x0000FF;
        // Intensity 0 lands on the background, 255 on the foreground, even
        // for pixels outside the pure black/white fast paths.
        assert_eq!(theme_tint(0xFF01_0000, fore, back), back);
        assert_eq!(theme_tint(0xFF00_00FF, fore, back), fore);

        let low = theme_tint(0xFF00_0040, fore, back);
        let mid = theme_tint(0xFF00_0080, fore, back);
        let high = theme_tint(0xFF00_00C0, fore, back);
        let red = |px: u32| (px >> 16) & 0xFF;
        let blue = |px: u32| px & 0xFF;
        assert!(red(low) < red(mid) && red(mid) < red(high));
        assert!(blue(low) > blue(mid) && blue(mid) > blue(high));
    }

    #[test]
    fn colorref_swaps_red_and_blue() {
        // COLORREF keeps red in the low byte; the DIB wants it high.
        assert_eq!(colorref_to_rgb(0x00FF_0000), 0x0000_00FF);
        assert_eq!(colorref_to_rgb(0x0000_00FF), 0x00FF_0000);
        assert_eq!(colorref_to_rgb(0x0000_FF00), 0x0000_FF00);
        assert_eq!(colorref_to_rgb(0x00C0_8040), 0x0040_80C0);
    }

    // ── Interaction state ───────────────────────────

    #[test]
    fn pointer_round_trip_leaves_no_residue() {
        let mut state = ButtonState::default();
        assert!(state.enter());
        state.press();
        state.release();
        state.leave();
        assert_eq!(state, ButtonState::default());
    }

    #[test]
    fn leave_clears_pressed_unconditionally() {
        let mut state = ButtonState::default();
        state.enter();
        state.press();
        state.leave();
        assert_eq!(state, ButtonState::default());
    }

    #[test]
    fn checked_survives_pointer_traffic() {
        let mut state = ButtonState::default();
        state.set_checked(true);
        state.enter();
        state.press();
        state.leave();
        assert!(state.checked);
        assert!(!state.hover);
        assert!(!state.pressed);
    }

    #[test]
    fn enter_reports_only_the_first_crossing() {
        let mut state = ButtonState::default();
        assert!(state.enter());
        assert!(!state.enter());
        state.leave();
        assert!(state.enter());
    }

    // ── Host protocol ───────────────────────────────

    #[test]
    fn commands_decode_by_id() {
        assert_eq!(
            HostCommand::decode(CMD_SET_ICON, "C:\\icons\\dock.ico"),
            Some(HostCommand::SetIcon(PathBuf::from("C:\\icons\\dock.ico")))
        );
        assert_eq!(
            HostCommand::decode(CMD_SET_ICON_HC, "hc.ico"),
            Some(HostCommand::SetIconHighContrast(PathBuf::from("hc.ico")))
        );
        assert_eq!(
            HostCommand::decode(CMD_SET_TOOLTIP, "Open settings"),
            Some(HostCommand::SetTooltip("Open settings".into()))
        );
        assert_eq!(
            HostCommand::decode(CMD_DESTROY, ""),
            Some(HostCommand::Destroy)
        );
    }

    #[test]
    fn checked_payload_is_case_insensitive() {
        assert_eq!(
            HostCommand::decode(CMD_SET_CHECKED, "true"),
            Some(HostCommand::SetChecked(true))
        );
        assert_eq!(
            HostCommand::decode(CMD_SET_CHECKED, "TRUE"),
            Some(HostCommand::SetChecked(true))
        );
        // Anything that is not "true" unchecks.
        assert_eq!(
            HostCommand::decode(CMD_SET_CHECKED, "false"),
            Some(HostCommand::SetChecked(false))
        );
        assert_eq!(
            HostCommand::decode(CMD_SET_CHECKED, "1"),
            Some(HostCommand::SetChecked(false))
        );
    }

    #[test]
    fn unknown_command_ids_are_dropped() {
        assert_eq!(HostCommand::decode(0, "x"), None);
        assert_eq!(HostCommand::decode(99, "x"), None);
    }

    #[test]
    fn unterminated_payload_is_reterminated() {
        // The last unit is sacrificed for the missing terminator.
        let units: Vec<u16> = "abc".encode_utf16().collect();
        assert_eq!(text_from_units(units), "ab");

        let mut terminated: Vec<u16> = "abc".encode_utf16().collect();
        terminated.push(0);
        assert_eq!(text_from_units(terminated), "abc");
    }

    #[test]
    fn payload_stops_at_the_first_terminator() {
        let units = vec![b'a' as u16, 0, b'b' as u16, 0];
        assert_eq!(text_from_units(units), "a");
    }

    #[test]
    fn empty_payload_decodes_to_empty_text() {
        assert_eq!(text_from_units(Vec::new()), "");
        assert_eq!(text_from_units(vec![0]), "");
    }

    #[test]
    fn packed_fields_hold_two_16_bit_halves() {
        assert_eq!(pack_pair(1700, 40), (40 << 16) | 1700);
        assert_eq!(pack_pair(0, 0), 0);
        // Negative coordinates truncate into their half, as on the wire.
        assert_eq!(pack_pair(-8, 1), 0x0001_FFF8);
    }

    // ── Icon source selection ───────────────────────

    #[test]
    fn icon_source_tracks_contrast_mode() {
        let mut ctx = ButtonContext::new();
        ctx.icon_path = Some(PathBuf::from("normal.ico"));
        ctx.icon_path_hc = Some(PathBuf::from("contrast.ico"));

        assert_eq!(ctx.icon_source(), Some(&PathBuf::from("normal.ico")));
        ctx.high_contrast = true;
        assert_eq!(ctx.icon_source(), Some(&PathBuf::from("contrast.ico")));
        // Toggling back yields the original source again.
        ctx.high_contrast = false;
        assert_eq!(ctx.icon_source(), Some(&PathBuf::from("normal.ico")));
    }

    #[test]
    fn high_contrast_falls_back_to_the_normal_icon() {
        let mut ctx = ButtonContext::new();
        ctx.icon_path = Some(PathBuf::from("normal.ico"));
        ctx.high_contrast = true;
        assert_eq!(ctx.icon_source(), Some(&PathBuf::from("normal.ico")));
        ctx.icon_path = None;
        assert_eq!(ctx.icon_source(), None);
    }
}
