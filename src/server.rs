use net2::TcpBuilder;
use std::io::{Read, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use asn1::DecodeError;
use datatype::Error;
use dispatch::{Dispatcher, HandleStatus};
use wire::Msg;


/// Why the serve loop returned.
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum ExitReason {
    Stopped,
    RebootNeeded,
}

/// A single-threaded request/response server for the Primary. One
/// connection is served at a time; within a connection every decoded
/// request gets exactly one response or the connection is closed.
pub struct SecondaryTcpServer {
    listener: TcpListener,
    dispatcher: Dispatcher,
    port: u16,
    running: Arc<AtomicBool>,
    reboot_after_install: bool,
    exit_reason: ExitReason,
}

impl SecondaryTcpServer {
    pub fn new(dispatcher: Dispatcher, port: u16, reboot_after_install: bool) -> Result<Self, Error> {
        SecondaryTcpServer::with_announcement(dispatcher, port, reboot_after_install, None)
    }

    /// Bind the listen socket and, when a Primary address is given, dial
    /// it from the listen port before listening so the Primary learns our
    /// port from the connection, serving one announcement session on that
    /// socket.
    pub fn with_announcement(mut dispatcher: Dispatcher,
                             port: u16,
                             reboot_after_install: bool,
                             primary: Option<(&str, u16)>) -> Result<Self, Error> {
        let builder = TcpBuilder::new_v6()?;
        builder.reuse_address(true)?;
        builder.bind((Ipv6Addr::new(0, 0, 0, 0, 0, 0, 0, 0), port))?;

        if let Some((primary_ip, primary_port)) = primary {
            if port == 0 {
                warn!("can't announce to the Primary from an OS-assigned port");
            } else {
                match dial_from_port(primary_ip, primary_port, port) {
                    Ok(stream) => {
                        info!("Connected to Primary, sending info about this Secondary.");
                        let _ = serve_connection(&mut dispatcher, stream, false);
                    }
                    Err(err) => info!("Failed to connect to Primary: {}", err),
                }
            }
        }

        let listener = builder.listen(128)?;
        let port = listener.local_addr()?.port();
        Ok(SecondaryTcpServer {
            listener: listener,
            dispatcher: dispatcher,
            port: port,
            running: Arc::new(AtomicBool::new(true)),
            reboot_after_install: reboot_after_install,
            exit_reason: ExitReason::Stopped,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// A handle that can stop the serve loop from another thread.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle { running: self.running.clone(), port: self.port }
    }

    /// Accept and serve connections until stopped or a handled install
    /// requires the whole process to exit for a reboot.
    pub fn run(&mut self) -> ExitReason {
        info!("Secondary TCP server listening on port {}.", self.port);
        while self.running.load(Ordering::SeqCst) {
            let (stream, _) = match self.listener.accept() {
                Ok(conn) => conn,
                Err(err) => {
                    // a broken listen socket would fail forever; exit and
                    // let a supervisor restart the daemon
                    error!("socket accept failed, aborting: {}", err);
                    break;
                }
            };
            if ! self.running.load(Ordering::SeqCst) {
                break; // stop() wakeup connection
            }

            debug!("Primary connected.");
            let (keep_server, reboot) =
                serve_connection(&mut self.dispatcher, stream, self.reboot_after_install);
            if reboot {
                self.exit_reason = ExitReason::RebootNeeded;
            }
            if ! keep_server {
                break;
            }
            debug!("Primary disconnected.");
        }
        info!("Secondary TCP server exiting.");
        self.exit_reason
    }
}


/// Stops the server: flips the running flag then makes a loopback
/// connection to unblock `accept`.
#[derive(Clone)]
pub struct StopHandle {
    running: Arc<AtomicBool>,
    port: u16,
}

impl StopHandle {
    pub fn stop(&self) {
        debug!("Stopping Secondary TCP server...");
        self.running.store(false, Ordering::SeqCst);
        let _ = TcpStream::connect(("::1", self.port));
    }
}


/// Dial out with SO_REUSEADDR from the not-yet-listening server port.
fn dial_from_port(primary_ip: &str, primary_port: u16, local_port: u16) -> Result<TcpStream, Error> {
    let addr = primary_ip.parse::<IpAddr>()
        .map_err(|err| Error::Socket(format!("bad primary_ip `{}`: {}", primary_ip, err)))?;
    let builder = match addr {
        IpAddr::V4(_) => TcpBuilder::new_v4()?,
        IpAddr::V6(_) => TcpBuilder::new_v6()?,
    };
    builder.reuse_address(true)?;
    match addr {
        IpAddr::V4(_) => builder.bind((Ipv4Addr::new(0, 0, 0, 0), local_port))?,
        IpAddr::V6(_) => builder.bind((Ipv6Addr::new(0, 0, 0, 0, 0, 0, 0, 0), local_port))?,
    };
    Ok(builder.connect((addr, primary_port))?)
}

/// Serve one connection's message loop. Returns whether the server should
/// keep running and whether a reboot became needed.
fn serve_connection(dispatcher: &mut Dispatcher,
                    mut stream: TcpStream,
                    reboot_after_install: bool) -> (bool, bool) {
    // one buffer for the connection: a single read may hold parts of two
    // messages
    let mut buffer = Vec::new();
    let mut reboot_needed = false;

    loop {
        let msg = match read_message(&mut stream, &mut buffer) {
            Some(msg) => msg,
            None => break,
        };

        match dispatcher.handle(&msg) {
            HandleStatus::Ok(resp) => {
                if ! send_response(&mut stream, &resp) {
                    break;
                }
            }

            HandleStatus::RebootRequired(resp) => {
                reboot_needed = true;
                let sent = send_response(&mut stream, &resp);
                if reboot_after_install {
                    return (false, true);
                }
                if ! sent {
                    break;
                }
            }

            HandleStatus::UnknownMsg => {
                info!("Unknown message received from Primary.");
                break;
            }
        }
    }
    (true, reboot_needed)
}

/// Read from the socket until the buffer holds one complete message.
fn read_message(stream: &mut TcpStream, buffer: &mut Vec<u8>) -> Option<Msg> {
    let mut chunk = [0u8; 4096];
    loop {
        match Msg::decode(buffer) {
            Ok((msg, used)) => {
                buffer.drain(..used);
                return Some(msg);
            }
            Err(DecodeError::MoreNeeded) => (),
            Err(DecodeError::Invalid(err)) => {
                error!("couldn't decode a message from Primary: {}", err);
                return None;
            }
        }

        match stream.read(&mut chunk) {
            Ok(0) => {
                debug!("Primary has closed the connection.");
                return None;
            }
            Ok(read) => buffer.extend_from_slice(&chunk[..read]),
            Err(err) => {
                debug!("connection read failed: {}", err);
                return None;
            }
        }
    }
}

/// Encode and send a response, letting Nagle batch the write and then
/// toggling TCP_NODELAY to flush it.
fn send_response(stream: &mut TcpStream, msg: &Msg) -> bool {
    let _ = stream.set_nodelay(false);
    let sent = stream.write_all(&msg.encode())
        .map_err(|err| error!("couldn't send a response: {}", err))
        .is_ok();
    let _ = stream.set_nodelay(true);
    sent
}
