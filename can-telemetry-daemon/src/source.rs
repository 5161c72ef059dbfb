//! Frame acquisition from a SocketCAN interface

use anyhow::{Context, Result};
use can_telemetry_core::types::{CanFrame, Timestamp};
use chrono::Utc;
use std::io;
use std::time::Duration;

/// How long a blocking read waits before yielding back to the caller
pub const READ_TIMEOUT: Duration = Duration::from_millis(500);

/// A blocking source of timestamped CAN frames.
///
/// `read_frame` returns `Ok(None)` when the read timed out or the frame
/// carried no data payload; the caller uses those gaps to poll window
/// expiry and the stop flag, so implementations must not block forever.
pub trait FrameSource: Send {
    fn read_frame(&mut self) -> Result<Option<(CanFrame, Timestamp)>>;
}

/// Frames read from a Linux SocketCAN interface, stamped on arrival
pub struct SocketCanSource {
    socket: socketcan::CanSocket,
    interface: String,
}

impl SocketCanSource {
    pub fn open(interface: &str) -> Result<Self> {
        use socketcan::Socket;

        let socket = socketcan::CanSocket::open(interface)
            .with_context(|| format!("Failed to open CAN interface {}", interface))?;
        socket
            .set_read_timeout(READ_TIMEOUT)
            .with_context(|| format!("Failed to set read timeout on {}", interface))?;

        log::info!("listening on CAN interface {}", interface);
        Ok(Self {
            socket,
            interface: interface.to_string(),
        })
    }
}

impl FrameSource for SocketCanSource {
    fn read_frame(&mut self) -> Result<Option<(CanFrame, Timestamp)>> {
        use socketcan::{EmbeddedFrame, Socket};

        match self.socket.read_frame() {
            Ok(socketcan::CanFrame::Data(frame)) => {
                let id = match frame.id() {
                    socketcan::Id::Standard(id) => id.as_raw() as u32,
                    socketcan::Id::Extended(id) => id.as_raw(),
                };
                Ok(Some((CanFrame::new(id, frame.data().to_vec()), Utc::now())))
            }
            // Remote and error frames carry no signal payload
            Ok(_) => Ok(None),
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock
                        | io::ErrorKind::TimedOut
                        | io::ErrorKind::Interrupted
                ) =>
            {
                Ok(None)
            }
            Err(e) => {
                Err(e).with_context(|| format!("Read failed on CAN interface {}", self.interface))
            }
        }
    }
}
