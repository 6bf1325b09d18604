use std::io;
use std::mem;

use windows_sys::Win32::Foundation::HANDLE;
use windows_sys::Win32::NetworkManagement::IpHelper::{
    IcmpCloseHandle, IcmpCreateFile, IcmpSendEcho, ICMP_ECHO_REPLY, IP_BUF_TOO_BIG, IP_PACKET_TOO_BIG, IP_SUCCESS,
};
use windows_sys::Win32::Networking::WinSock::{
    getsockopt, setsockopt, WSACloseEvent, WSACreateEvent, WSAEnumNetworkEvents, WSAEventSelect, WSAGetLastError,
    WSAResetEvent, WSASetEvent, SOCKET, WSANETWORKEVENTS,
};

use crate::socket::{PingOutcome, Pinger};
use std::net::IpAddr;

pub type RawWsaEvent = HANDLE;

pub const INVALID_WSA_EVENT: RawWsaEvent = std::ptr::null_mut();

/// Owned manual-reset WSA event object.
pub struct WsaEvent(RawWsaEvent);

// The handle is only ever passed to WinSock calls, which are thread safe.
unsafe impl Send for WsaEvent {}
unsafe impl Sync for WsaEvent {}

impl WsaEvent {
    pub fn new() -> io::Result<WsaEvent> {
        let ev = unsafe { WSACreateEvent() };
        if ev == INVALID_WSA_EVENT {
            return Err(last_wsa_error());
        }
        Ok(WsaEvent(ev))
    }

    pub fn raw(&self) -> RawWsaEvent {
        self.0
    }

    pub fn set(&self) {
        unsafe { WSASetEvent(self.0) };
    }

    pub fn reset(&self) {
        unsafe { WSAResetEvent(self.0) };
    }
}

impl Drop for WsaEvent {
    fn drop(&mut self) {
        unsafe { WSACloseEvent(self.0) };
    }
}

pub fn last_wsa_error() -> io::Error {
    io::Error::from_raw_os_error(unsafe { WSAGetLastError() })
}

/// Arms the socket onto the shared event for the given native event mask.
pub fn event_select(socket: SOCKET, event: RawWsaEvent, network_events: i32) -> io::Result<()> {
    if unsafe { WSAEventSelect(socket, event, network_events) } != 0 {
        return Err(last_wsa_error());
    }
    Ok(())
}

/// Harvests and resets the recorded network events for the socket.
pub fn enum_network_events(socket: SOCKET, event: RawWsaEvent) -> io::Result<WSANETWORKEVENTS> {
    let mut events: WSANETWORKEVENTS = unsafe { mem::zeroed() };
    if unsafe { WSAEnumNetworkEvents(socket, event, &mut events) } != 0 {
        return Err(last_wsa_error());
    }
    Ok(events)
}

pub fn getsockopt_int(socket: SOCKET, level: i32, opt: i32) -> io::Result<i32> {
    let mut value: i32 = 0;
    let mut len = mem::size_of::<i32>() as i32;
    let rc = unsafe { getsockopt(socket, level, opt, &mut value as *mut _ as *mut u8, &mut len) };
    if rc != 0 {
        return Err(last_wsa_error());
    }
    Ok(value)
}

pub fn setsockopt_int(socket: SOCKET, level: i32, opt: i32, value: i32) -> io::Result<()> {
    let len = mem::size_of::<i32>() as i32;
    let rc = unsafe { setsockopt(socket, level, opt, &value as *const _ as *const u8, len) };
    if rc != 0 {
        return Err(last_wsa_error());
    }
    Ok(())
}

/// ICMP echo prober used by the path MTU ladder.
pub struct IcmpPinger {
    handle: HANDLE,
    payload: Vec<u8>,
    reply: Vec<u8>,
}

impl IcmpPinger {
    pub fn new() -> io::Result<IcmpPinger> {
        let handle = unsafe { IcmpCreateFile() };
        if handle.is_null() {
            return Err(io::Error::last_os_error());
        }
        Ok(IcmpPinger {
            handle,
            payload: Vec::new(),
            reply: Vec::new(),
        })
    }
}

impl Pinger for IcmpPinger {
    fn ping(&mut self, dest: IpAddr, payload_len: u16) -> PingOutcome {
        let IpAddr::V4(v4) = dest else {
            return PingOutcome::Failed;
        };
        self.payload.resize(payload_len as usize, 0);
        self.reply
            .resize(mem::size_of::<ICMP_ECHO_REPLY>() + payload_len as usize + 8, 0);
        let dest = u32::from_le_bytes(v4.octets());
        let replies = unsafe {
            IcmpSendEcho(
                self.handle,
                dest,
                self.payload.as_mut_ptr().cast(),
                payload_len,
                std::ptr::null(),
                self.reply.as_mut_ptr().cast(),
                self.reply.len() as u32,
                1000,
            )
        };
        if replies == 0 {
            return PingOutcome::Failed;
        }
        let reply = unsafe { &*(self.reply.as_ptr() as *const ICMP_ECHO_REPLY) };
        match reply.Status {
            IP_SUCCESS => PingOutcome::Delivered,
            IP_PACKET_TOO_BIG | IP_BUF_TOO_BIG => PingOutcome::TooLarge,
            _ => PingOutcome::Failed,
        }
    }
}

impl Drop for IcmpPinger {
    fn drop(&mut self) {
        unsafe { IcmpCloseHandle(self.handle) };
    }
}
