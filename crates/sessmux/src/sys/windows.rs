//! Thin wrappers over the WSA event-array API
//!
//! Everything unsafe about event objects, multi-event waits and network
//! event enumeration is contained here; the producer above deals in owned
//! wrappers and plain outcomes.

use std::io;
use std::ptr;

use windows_sys::Win32::Foundation::{
    CloseHandle, GetLastError, HANDLE, WAIT_FAILED, WAIT_OBJECT_0, WAIT_TIMEOUT,
};
use windows_sys::Win32::Networking::WinSock::{
    WSACloseEvent, WSACreateEvent, WSAEnumNetworkEvents, WSAEventSelect, WSAGetLastError,
    WSAResetEvent, WSASetEvent, WSAWaitForMultipleEvents, FD_CLOSE, FD_CLOSE_BIT, FD_READ,
    FD_READ_BIT, SOCKET, SOCKET_ERROR, WSAENOTSOCK, WSANETWORKEVENTS, WSA_WAIT_EVENT_0,
    WSA_WAIT_FAILED, WSA_WAIT_TIMEOUT,
};
use windows_sys::Win32::System::Threading::{
    CreateEventW, ResetEvent, SetEvent, WaitForMultipleObjects,
};

use crate::session::SocketId;

/// A shareable, copyable view of an event object owned elsewhere.
///
/// Valid only while its owner is alive; the producer guarantees that by
/// keeping every owner (abort event, join events, socket events) alive for
/// the lifetime of the threads that wait on it.
///
/// `repr(transparent)`: slices of these are passed to the OS as handle
/// arrays directly.
#[derive(Clone, Copy)]
#[repr(transparent)]
pub(crate) struct RawEventHandle(HANDLE);

// Event handles are process-wide kernel object references; the kernel
// synchronizes access.
unsafe impl Send for RawEventHandle {}
unsafe impl Sync for RawEventHandle {}

impl RawEventHandle {
    fn as_raw(self) -> HANDLE {
        self.0
    }
}

fn last_wsa_error() -> io::Error {
    io::Error::from_raw_os_error(unsafe { WSAGetLastError() })
}

fn last_os_error() -> io::Error {
    io::Error::from_raw_os_error(unsafe { GetLastError() } as i32)
}

/// Owned manual-reset WSA event object.
pub(crate) struct WsaEvent {
    handle: HANDLE,
}

unsafe impl Send for WsaEvent {}
unsafe impl Sync for WsaEvent {}

impl WsaEvent {
    pub(crate) fn new() -> io::Result<Self> {
        let handle = unsafe { WSACreateEvent() };
        if handle.is_null() {
            return Err(last_wsa_error());
        }

        Ok(Self { handle })
    }

    pub(crate) fn handle(&self) -> RawEventHandle {
        RawEventHandle(self.handle)
    }

    /// Signal the event. Returns `false` on OS failure.
    pub(crate) fn set(&self) -> bool {
        unsafe { WSASetEvent(self.handle) != 0 }
    }

    /// Reset the manual-reset event. Returns `false` on OS failure.
    pub(crate) fn reset(&self) -> bool {
        unsafe { WSAResetEvent(self.handle) != 0 }
    }
}

impl Drop for WsaEvent {
    fn drop(&mut self) {
        unsafe { WSACloseEvent(self.handle) };
    }
}

/// Manual-reset WSA event bound to one socket for read/close notification.
pub(crate) struct WsaSocketEvent {
    event: WsaEvent,
}

impl WsaSocketEvent {
    /// Create the event object and associate it with `socket` for
    /// `FD_READ | FD_CLOSE`. Write events are not monitored; outgoing
    /// traffic needs no notification.
    pub(crate) fn for_socket(socket: SocketId) -> io::Result<Self> {
        let event = WsaEvent::new()?;

        let rc = unsafe {
            WSAEventSelect(
                socket as SOCKET,
                event.handle,
                (FD_READ | FD_CLOSE) as i32,
            )
        };
        if rc == SOCKET_ERROR {
            return Err(last_wsa_error());
        }

        Ok(Self { event })
    }

    pub(crate) fn handle(&self) -> RawEventHandle {
        self.event.handle()
    }

    pub(crate) fn reset(&self) -> bool {
        self.event.reset()
    }
}

/// Owned manual-reset kernel event (the join events).
pub(crate) struct ManualResetEvent {
    handle: HANDLE,
}

unsafe impl Send for ManualResetEvent {}
unsafe impl Sync for ManualResetEvent {}

impl ManualResetEvent {
    pub(crate) fn new() -> io::Result<Self> {
        let handle = unsafe { CreateEventW(ptr::null(), 1, 0, ptr::null()) };
        if handle.is_null() {
            return Err(last_os_error());
        }

        Ok(Self { handle })
    }

    pub(crate) fn handle(&self) -> RawEventHandle {
        RawEventHandle(self.handle)
    }

    pub(crate) fn set(&self) -> bool {
        unsafe { SetEvent(self.handle) != 0 }
    }

    pub(crate) fn reset(&self) -> bool {
        unsafe { ResetEvent(self.handle) != 0 }
    }
}

impl Drop for ManualResetEvent {
    fn drop(&mut self) {
        unsafe { CloseHandle(self.handle) };
    }
}

/// Outcome of a bounded multi-event wait.
pub(crate) enum WaitOutcome {
    /// Index of the first signalled slot in the wait array.
    Signaled(usize),
    Timeout,
    Failed(io::Error),
}

/// Wait on an array of WSA events. `events` must not be empty and must not
/// exceed the platform's 64-slot limit.
pub(crate) fn wait_for_wsa_events(
    events: &[RawEventHandle],
    wait_all: bool,
    timeout_ms: u32,
) -> WaitOutcome {
    let rc = unsafe {
        WSAWaitForMultipleEvents(
            events.len() as u32,
            events.as_ptr().cast::<HANDLE>(),
            wait_all as i32,
            timeout_ms,
            0,
        )
    };

    if rc == WSA_WAIT_FAILED {
        WaitOutcome::Failed(last_wsa_error())
    } else if rc == WSA_WAIT_TIMEOUT {
        WaitOutcome::Timeout
    } else {
        WaitOutcome::Signaled((rc - WSA_WAIT_EVENT_0) as usize)
    }
}

/// Wait on an array of kernel event handles.
pub(crate) fn wait_for_event_handles(
    handles: &[RawEventHandle],
    wait_all: bool,
    timeout_ms: u32,
) -> WaitOutcome {
    let rc = unsafe {
        WaitForMultipleObjects(
            handles.len() as u32,
            handles.as_ptr().cast::<HANDLE>(),
            wait_all as i32,
            timeout_ms,
        )
    };

    if rc == WAIT_FAILED {
        WaitOutcome::Failed(last_os_error())
    } else if rc == WAIT_TIMEOUT {
        WaitOutcome::Timeout
    } else {
        WaitOutcome::Signaled((rc - WAIT_OBJECT_0) as usize)
    }
}

/// Network events reported for one socket, with per-bit error codes.
#[derive(Default)]
pub(crate) struct NetworkEvents {
    pub read: bool,
    pub read_error: i32,
    pub close: bool,
    pub close_error: i32,
}

/// Enumerate and clear the pending network events for `socket`.
pub(crate) fn enumerate_network_events(
    socket: SocketId,
    event: RawEventHandle,
) -> io::Result<NetworkEvents> {
    let mut raw = WSANETWORKEVENTS {
        lNetworkEvents: 0,
        iErrorCode: [0; 10],
    };

    let rc = unsafe { WSAEnumNetworkEvents(socket as SOCKET, event.as_raw(), &mut raw) };
    if rc == SOCKET_ERROR {
        return Err(last_wsa_error());
    }

    Ok(NetworkEvents {
        read: raw.lNetworkEvents & FD_READ as i32 != 0,
        read_error: raw.iErrorCode[FD_READ_BIT as usize],
        close: raw.lNetworkEvents & FD_CLOSE as i32 != 0,
        close_error: raw.iErrorCode[FD_CLOSE_BIT as usize],
    })
}

/// Whether `error` is the "this descriptor is not a socket" failure, which
/// the producer treats as a close.
pub(crate) fn is_not_a_socket(error: &io::Error) -> bool {
    error.raw_os_error() == Some(WSAENOTSOCK)
}
