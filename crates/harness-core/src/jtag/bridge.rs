//! Non-blocking `jtag_vpi` server.
//!
//! The listener and client socket never block the simulation loop. Bytes of a
//! request that arrive in pieces accumulate in an inbox, and replies the
//! socket cannot take at once wait in an outbox.

use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};

use tracing::{debug, info, warn};

use super::packet::{VpiCommand, VpiPacket, PACKET_SIZE};
use super::shifter::JtagShifter;
use crate::error::HarnessError;

/// Result of one [`JtagBridge::step`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JtagStatus {
    /// Nothing fatal happened; the simulation continues.
    Success,
    /// The client closed the connection or asked to stop.
    ClientDisconnected,
    /// The client sent a malformed request.
    ProtocolError,
}

/// TCP server speaking the OpenOCD `jtag_vpi` protocol.
#[derive(Debug)]
pub struct JtagBridge {
    listener: TcpListener,
    client: Option<TcpStream>,
    inbox: Vec<u8>,
    outbox: Vec<u8>,
    shifter: JtagShifter,
    last_cycle: u64,
    last_status: JtagStatus,
}

impl JtagBridge {
    /// Binds the listener on `port`.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::Startup`] when the port cannot be bound.
    pub fn initialize(port: u16, loopback_only: bool) -> Result<Self, HarnessError> {
        let ip = if loopback_only {
            Ipv4Addr::LOCALHOST
        } else {
            Ipv4Addr::UNSPECIFIED
        };
        let addr = SocketAddr::from((ip, port));
        let startup = |source| HarnessError::Startup {
            transport: "jtag",
            addr,
            source,
        };
        let listener = TcpListener::bind(addr).map_err(startup)?;
        listener.set_nonblocking(true).map_err(startup)?;
        info!(%addr, "JTAG VPI server listening");
        Ok(Self {
            listener,
            client: None,
            inbox: Vec::with_capacity(PACKET_SIZE),
            outbox: Vec::new(),
            shifter: JtagShifter::new(),
            last_cycle: 0,
            last_status: JtagStatus::Success,
        })
    }

    /// Address the listener is bound to.
    ///
    /// # Errors
    ///
    /// Propagates the socket error.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Returns true while a client is attached.
    #[must_use]
    pub const fn is_connected(&self) -> bool {
        self.client.is_some()
    }

    /// Status returned by the most recent step.
    #[must_use]
    pub const fn last_status(&self) -> JtagStatus {
        self.last_status
    }

    /// Cycle index passed to the most recent step.
    #[must_use]
    pub const fn last_cycle(&self) -> u64 {
        self.last_cycle
    }

    /// Services the socket and advances the TCK waveform by one phase.
    ///
    /// `tms`, `tdi` and `tck` receive the levels to drive; `tdo` is the
    /// target's current output.
    pub fn step(
        &mut self,
        cycle_index: u64,
        tms: &mut bool,
        tdi: &mut bool,
        tck: &mut bool,
        tdo: bool,
    ) -> JtagStatus {
        self.last_cycle = cycle_index;
        let status = self.service(tdo);
        let lines = self.shifter.lines();
        *tms = lines.tms;
        *tdi = lines.tdi;
        *tck = lines.tck;
        self.last_status = status;
        status
    }

    /// Drops the client connection.
    pub fn close(&mut self) {
        if let Some(client) = self.client.take() {
            let _ = client.shutdown(std::net::Shutdown::Both);
            debug!("JTAG client socket closed");
        }
        self.inbox.clear();
        self.outbox.clear();
    }

    fn service(&mut self, tdo: bool) -> JtagStatus {
        if self.client.is_none() && !self.accept() {
            return JtagStatus::Success;
        }
        if let Err(status) = self.flush() {
            return self.fail(status);
        }
        if !self.shifter.is_busy() && self.outbox.is_empty() {
            match self.receive() {
                Ok(Some(packet)) => match packet.command() {
                    Ok(VpiCommand::StopSimulation) => {
                        info!(cycle = self.last_cycle, "JTAG client requested stop");
                        return self.fail(JtagStatus::ClientDisconnected);
                    }
                    Ok(command) => {
                        debug!(?command, nb_bits = packet.nb_bits, "JTAG request");
                        self.shifter.load(command, packet);
                    }
                    Err(error) => {
                        warn!(%error, "JTAG protocol error");
                        return self.fail(JtagStatus::ProtocolError);
                    }
                },
                Ok(None) => {}
                Err(status) => return self.fail(status),
            }
        }
        if let Some(reply) = self.shifter.step(tdo) {
            self.outbox.extend_from_slice(&reply.encode());
            if let Err(status) = self.flush() {
                return self.fail(status);
            }
        }
        JtagStatus::Success
    }

    fn accept(&mut self) -> bool {
        match self.listener.accept() {
            Ok((stream, peer)) => {
                if let Err(error) = stream.set_nonblocking(true) {
                    warn!(%peer, %error, "rejecting JTAG client");
                    return false;
                }
                let _ = stream.set_nodelay(true);
                info!(%peer, "JTAG client connected");
                self.client = Some(stream);
                true
            }
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => false,
            Err(error) => {
                warn!(%error, "JTAG accept failed");
                false
            }
        }
    }

    fn receive(&mut self) -> Result<Option<VpiPacket>, JtagStatus> {
        let Some(stream) = self.client.as_mut() else {
            return Ok(None);
        };
        let mut chunk = [0u8; PACKET_SIZE];
        while self.inbox.len() < PACKET_SIZE {
            let wanted = PACKET_SIZE - self.inbox.len();
            match stream.read(&mut chunk[..wanted]) {
                Ok(0) => {
                    info!("JTAG client disconnected");
                    return Err(JtagStatus::ClientDisconnected);
                }
                Ok(read) => self.inbox.extend_from_slice(&chunk[..read]),
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
                Err(error) => {
                    warn!(%error, "JTAG read failed");
                    return Err(JtagStatus::ClientDisconnected);
                }
            }
        }
        let packet = VpiPacket::decode(&self.inbox);
        self.inbox.clear();
        Ok(packet)
    }

    fn flush(&mut self) -> Result<(), JtagStatus> {
        let Some(stream) = self.client.as_mut() else {
            return Ok(());
        };
        while !self.outbox.is_empty() {
            match stream.write(&self.outbox) {
                Ok(0) => return Err(JtagStatus::ClientDisconnected),
                Ok(written) => {
                    self.outbox.drain(..written);
                }
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
                Err(error) => {
                    warn!(%error, "JTAG write failed");
                    return Err(JtagStatus::ClientDisconnected);
                }
            }
        }
        Ok(())
    }

    fn fail(&mut self, status: JtagStatus) -> JtagStatus {
        self.close();
        status
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::thread;
    use std::time::Duration;

    use super::{JtagBridge, JtagStatus};
    use crate::error::HarnessError;
    use crate::jtag::packet::{VpiCommand, VpiPacket, PACKET_SIZE};

    struct Lines {
        tms: bool,
        tdi: bool,
        tck: bool,
    }

    fn connect() -> (JtagBridge, TcpStream) {
        let bridge = JtagBridge::initialize(0, true).expect("bind ephemeral port");
        let addr = bridge.local_addr().expect("local addr");
        let client = TcpStream::connect(addr).expect("connect");
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .expect("read timeout");
        (bridge, client)
    }

    /// Steps until `done` holds or the step budget runs out.
    fn step_until(
        bridge: &mut JtagBridge,
        lines: &mut Lines,
        tdo: bool,
        mut done: impl FnMut(JtagStatus, &JtagBridge) -> bool,
    ) -> JtagStatus {
        for cycle in 0..20_000 {
            let status = bridge.step(cycle, &mut lines.tms, &mut lines.tdi, &mut lines.tck, tdo);
            if done(status, bridge) {
                return status;
            }
            if cycle % 100 == 99 {
                thread::sleep(Duration::from_millis(1));
            }
        }
        panic!("bridge did not reach the expected state");
    }

    fn lines() -> Lines {
        Lines {
            tms: false,
            tdi: false,
            tck: false,
        }
    }

    #[test]
    fn bind_conflict_is_a_startup_error() {
        let taken = TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = taken.local_addr().expect("addr").port();
        let error = JtagBridge::initialize(port, true).expect_err("port in use");
        assert!(matches!(error, HarnessError::Startup { transport: "jtag", .. }));
    }

    #[test]
    fn idle_server_keeps_tck_high() {
        let mut bridge = JtagBridge::initialize(0, true).expect("bind");
        let mut lines = lines();
        let status = bridge.step(0, &mut lines.tms, &mut lines.tdi, &mut lines.tck, false);
        assert_eq!(status, JtagStatus::Success);
        assert!(lines.tck);
        assert!(!bridge.is_connected());
    }

    #[test]
    fn scan_request_split_across_writes_is_answered() {
        let (mut bridge, mut client) = connect();
        let request = VpiPacket::request(VpiCommand::ScanChain, &[0x0F], 8).encode();
        client.write_all(&request[..100]).expect("first half");
        let mut lines = lines();
        step_until(&mut bridge, &mut lines, true, |_, bridge| bridge.is_connected());
        client.write_all(&request[100..]).expect("second half");

        let mut reply = vec![0u8; PACKET_SIZE];
        let reader = thread::spawn(move || {
            client.read_exact(&mut reply).expect("reply");
            reply
        });
        step_until(&mut bridge, &mut lines, true, |_, _| reader.is_finished());
        let reply = VpiPacket::decode(&reader.join().expect("reader")).expect("decoded");
        assert_eq!(reply.cmd, VpiCommand::ScanChain as u32);
        assert_eq!(reply.buffer_in[0], 0xFF);
        assert_eq!(reply.nb_bits, 8);
    }

    #[test]
    fn unknown_command_is_a_protocol_error() {
        let (mut bridge, mut client) = connect();
        let bogus = VpiPacket {
            cmd: 9,
            ..VpiPacket::default()
        };
        client.write_all(&bogus.encode()).expect("send");
        let mut lines = lines();
        let status = step_until(&mut bridge, &mut lines, false, |status, _| {
            status != JtagStatus::Success
        });
        assert_eq!(status, JtagStatus::ProtocolError);
        assert!(!bridge.is_connected());
    }

    #[test]
    fn closing_the_socket_reports_disconnect() {
        let (mut bridge, client) = connect();
        let mut lines = lines();
        step_until(&mut bridge, &mut lines, false, |_, bridge| bridge.is_connected());
        drop(client);
        let status = step_until(&mut bridge, &mut lines, false, |status, _| {
            status != JtagStatus::Success
        });
        assert_eq!(status, JtagStatus::ClientDisconnected);
    }

    #[test]
    fn stop_request_ends_the_session() {
        let (mut bridge, mut client) = connect();
        client
            .write_all(&VpiPacket::request(VpiCommand::StopSimulation, &[], 0).encode())
            .expect("send");
        let mut lines = lines();
        let status = step_until(&mut bridge, &mut lines, false, |status, _| {
            status != JtagStatus::Success
        });
        assert_eq!(status, JtagStatus::ClientDisconnected);
    }
}
