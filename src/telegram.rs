//! Bot relay client: long-polls getUpdates and posts replies.
//!
//! Each HTTP exchange opens its own TCP connection to the relay, sends one
//! request and reads until the response is complete or the relay closes.

use core::sync::atomic::{AtomicBool, AtomicU16, Ordering};

use esp_radio::wifi::WifiDevice;
use gatekeeper::bot::{self, BotError, UpdateOffset, MAX_TOKENS};
use gatekeeper::config::NetConfig;
use gatekeeper::dispatch::{Dispatcher, GateLink};
use gatekeeper::gate::Clock;
use gatekeeper::storage::Store;
use gatekeeper::ticks;
use gatekeeper::tokenizer::{Token, TokenKind};
use heapless::String as HString;
use smoltcp::iface::{Interface, SocketHandle, SocketSet};
use smoltcp::socket::tcp::{Socket as TcpSocket, SocketBuffer, State as TcpState};
use smoltcp::time::Instant as SmoltcpInstant;
use smoltcp::wire::{IpAddress, Ipv4Address};

use crate::shared::{uptime_ms, HalClock};

const CONNECT_TIMEOUT_MS: u32 = 5_000;
const RESPONSE_TIMEOUT_MS: u32 = 10_000;
const WATCHDOG_FEED_MS: u32 = 5_000;
const LOCAL_PORT_BASE: u16 = 49152;

// Static buffers with taken flags; core 1's stack can't hold them.
static SOCKET_BUFFERS_TAKEN: AtomicBool = AtomicBool::new(false);
static mut RX_BUF: [u8; 2048] = [0; 2048];
static mut TX_BUF: [u8; 3072] = [0; 3072];

static POLL_BUFFERS_TAKEN: AtomicBool = AtomicBool::new(false);
static mut RESPONSE_BUF: [u8; 8192] = [0; 8192];
static mut TOKENS: [Token; MAX_TOKENS] = [Token {
    kind: TokenKind::Undefined,
    start: 0,
    end: 0,
    size: 0,
}; MAX_TOKENS];

static NEXT_PORT: AtomicU16 = AtomicU16::new(0);

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("connect failed")]
    Connect,
    #[error("connect timed out")]
    ConnectTimeout,
    #[error("send failed")]
    Send,
    #[error("response timed out")]
    ResponseTimeout,
    #[error("connection closed without a response")]
    Closed,
    #[error(transparent)]
    Bot(#[from] BotError),
}

/// Releases a buffer flag on drop.
struct BufferGuard(&'static AtomicBool);

impl Drop for BufferGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

fn take_socket_buffers() -> (&'static mut [u8], &'static mut [u8], BufferGuard) {
    if SOCKET_BUFFERS_TAKEN.swap(true, Ordering::Acquire) {
        panic!("relay exchange called reentrantly!");
    }
    // SAFETY: SOCKET_BUFFERS_TAKEN was false, so nothing else holds these.
    unsafe {
        (
            &mut (*core::ptr::addr_of_mut!(RX_BUF))[..],
            &mut (*core::ptr::addr_of_mut!(TX_BUF))[..],
            BufferGuard(&SOCKET_BUFFERS_TAKEN),
        )
    }
}

fn take_poll_buffers() -> (&'static mut [u8], &'static mut [Token], BufferGuard) {
    if POLL_BUFFERS_TAKEN.swap(true, Ordering::Acquire) {
        panic!("poll_updates called reentrantly!");
    }
    // SAFETY: POLL_BUFFERS_TAKEN was false, so nothing else holds these.
    unsafe {
        (
            &mut (*core::ptr::addr_of_mut!(RESPONSE_BUF))[..],
            &mut (*core::ptr::addr_of_mut!(TOKENS))[..],
            BufferGuard(&POLL_BUFFERS_TAKEN),
        )
    }
}

/// Where the relay lives and which bot it speaks for.
pub struct Relay {
    remote: (IpAddress, u16),
    host: &'static str,
    token: &'static str,
}

impl Relay {
    pub fn new(config: &NetConfig) -> Option<Self> {
        let ip = parse_ipv4(config.relay_host)?;
        Some(Self {
            remote: (IpAddress::Ipv4(ip), config.relay_port),
            host: config.relay_host,
            token: config.bot_token,
        })
    }
}

/// The network stack, borrowed from the core 1 loop for one poll.
pub struct Link<'a, 's> {
    pub iface: &'a mut Interface,
    pub device: &'a mut WifiDevice<'static>,
    pub sockets: &'a mut SocketSet<'s>,
}

impl Link<'_, '_> {
    fn poll(&mut self) {
        let now = SmoltcpInstant::from_millis(uptime_ms() as i64);
        self.iface.poll(now, self.device, self.sockets);
    }
}

/// Fetch pending updates, dispatch them and send the replies.
pub fn poll_updates<S, G>(
    link: &mut Link<'_, '_>,
    relay: &Relay,
    dispatcher: &mut Dispatcher<'_, S, G>,
    offset: &mut UpdateOffset,
) where
    S: Store + ?Sized,
    G: GateLink + ?Sized,
{
    let (response_buf, tokens, _guard) = take_poll_buffers();

    let mut request: HString<256> = HString::new();
    if let Err(e) = bot::get_updates_request(&mut request, relay.host, relay.token, *offset) {
        log::error!("bot: cannot build getUpdates: {}", e);
        return;
    }

    let len = match exchange(link, relay, request.as_bytes(), response_buf) {
        Ok(len) => len,
        Err(e) => {
            log::warn!("bot: getUpdates failed: {}", e);
            return;
        }
    };
    let response = &response_buf[..len];

    let result = bot::handle_updates(response, tokens, dispatcher, |chat_id, text| {
        if let Err(e) = send_reply(link, relay, chat_id, text) {
            log::error!("bot: reply to {} failed: {}", chat_id, e);
        }
    });

    match result {
        Ok(summary) => offset.advance(&summary),
        Err(e) => {
            log::error!("bot: getUpdates response rejected: {}", e);
            if !offset.recover(&e, response) {
                log::warn!("bot: no update id in {} byte response", len);
            }
        }
    }
}

fn send_reply(
    link: &mut Link<'_, '_>,
    relay: &Relay,
    chat_id: i64,
    text: &str,
) -> Result<(), RelayError> {
    let mut body: HString<2560> = HString::new();
    bot::send_message_body(&mut body, chat_id, text)?;
    let mut request: HString<3072> = HString::new();
    bot::send_message_request(&mut request, relay.host, relay.token, &body)?;

    // Only the status line matters; the echoed message may be cut off.
    let mut response = [0u8; 512];
    let len = exchange(link, relay, request.as_bytes(), &mut response)?;
    match bot::http_status(&response[..len]) {
        Some(200) => Ok(()),
        Some(code) => Err(BotError::Status(code).into()),
        None => Err(BotError::Malformed.into()),
    }
}

/// Properly close and remove a socket to avoid leaving TCP connections half-open.
fn close_and_remove_socket(sockets: &mut SocketSet<'_>, handle: SocketHandle) {
    let socket = sockets.get_mut::<TcpSocket>(handle);
    socket.close();
    sockets.remove(handle);
}

fn next_local_port() -> u16 {
    LOCAL_PORT_BASE + NEXT_PORT.fetch_add(1, Ordering::Relaxed) % 1024
}

/// One request/response over a fresh connection. Returns the number of
/// response bytes; a response longer than `response` is cut at its length.
fn exchange(
    link: &mut Link<'_, '_>,
    relay: &Relay,
    request: &[u8],
    response: &mut [u8],
) -> Result<usize, RelayError> {
    let (rx_buf, tx_buf, _guard) = take_socket_buffers();
    let socket = TcpSocket::new(SocketBuffer::new(rx_buf), SocketBuffer::new(tx_buf));
    let handle = link.sockets.add(socket);

    let result = run_exchange(link, handle, relay, request, response);
    close_and_remove_socket(link.sockets, handle);
    result
}

fn run_exchange(
    link: &mut Link<'_, '_>,
    handle: SocketHandle,
    relay: &Relay,
    request: &[u8],
    response: &mut [u8],
) -> Result<usize, RelayError> {
    let clock = HalClock;

    {
        let socket = link.sockets.get_mut::<TcpSocket>(handle);
        socket
            .connect(link.iface.context(), relay.remote, next_local_port())
            .map_err(|_| RelayError::Connect)?;
    }

    let deadline = ticks::add(clock.now(), CONNECT_TIMEOUT_MS as i32);
    let mut last_wdt_feed = clock.now();
    loop {
        link.poll();
        let now = clock.now();
        let socket = link.sockets.get_mut::<TcpSocket>(handle);
        if socket.may_send() {
            break;
        }
        if !ticks::is_after(deadline, now) || socket.state() == TcpState::Closed {
            return Err(RelayError::ConnectTimeout);
        }
        if now.wrapping_sub(last_wdt_feed) >= WATCHDOG_FEED_MS {
            last_wdt_feed = now;
            crate::feed_watchdog();
        }
        clock.pause_ms(10);
    }

    let mut sent = 0;
    let mut received = 0;
    let deadline = ticks::add(clock.now(), RESPONSE_TIMEOUT_MS as i32);
    loop {
        link.poll();
        let now = clock.now();
        let socket = link.sockets.get_mut::<TcpSocket>(handle);

        if sent < request.len() && socket.can_send() {
            sent += socket
                .send_slice(&request[sent..])
                .map_err(|_| RelayError::Send)?;
        }

        if socket.can_recv() {
            if let Ok(n) = socket.recv_slice(&mut response[received..]) {
                received += n;
            }
        }

        if received == response.len() {
            log::debug!("relay: response cut at {} bytes", received);
            break;
        }
        if received > 0 {
            if let Some(header_end) = find_header_end(&response[..received]) {
                if let Some(content_len) = parse_content_length(&response[..header_end]) {
                    if received >= header_end + 4 + content_len {
                        break;
                    }
                } else if matches!(socket.state(), TcpState::CloseWait | TcpState::Closed) {
                    break;
                }
            }
        }

        if socket.state() == TcpState::Closed && received == 0 {
            return Err(RelayError::Closed);
        }
        if !ticks::is_after(deadline, now) {
            return Err(RelayError::ResponseTimeout);
        }
        if now.wrapping_sub(last_wdt_feed) >= WATCHDOG_FEED_MS {
            last_wdt_feed = now;
            crate::feed_watchdog();
        }
        clock.pause_ms(10);
    }

    Ok(received)
}

fn find_header_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Parse an IPv4 address from a string without heap allocation.
fn parse_ipv4(s: &str) -> Option<Ipv4Address> {
    let mut octets = [0u8; 4];
    let mut count = 0;

    for part in s.split('.') {
        if count >= 4 {
            return None;
        }
        octets[count] = part.parse().ok()?;
        count += 1;
    }

    if count == 4 {
        Some(Ipv4Address::new(octets[0], octets[1], octets[2], octets[3]))
    } else {
        None
    }
}

fn parse_content_length(header: &[u8]) -> Option<usize> {
    let header_str = core::str::from_utf8(header).ok()?;
    for line in header_str.lines() {
        if let Some(name) = line.get(..15) {
            if name.eq_ignore_ascii_case("content-length:") {
                return line[15..].trim().parse().ok();
            }
        }
    }
    None
}
