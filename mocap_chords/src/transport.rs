//! OSC over UDP, in both directions.
//!
//! * [`OscReceiver`]: the capture feed.  Bundles are flattened; datagrams
//!   that do not decode are logged and dropped.
//! * [`OscOut`]: a [`MidiOut`] backend that forwards scheduler events to an
//!   OSC instrument:
//!
//! | event | address | args |
//! |---|---|---|
//! | pitch bend   | `<prefix>/pitch_bend`    | `[channel+1, value]` |
//! | note on      | `<prefix>/note_on`       | `[channel+1, key, velocity]` |
//! | all notes off| `<prefix>/all_notes_off` | `[channel+1]` |

use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket as StdUdpSocket};

use rosc::{decoder, encoder, OscMessage, OscPacket, OscType};
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use microtonal_midi::{MidiEvent, MidiOut, OutputError};

/// Largest UDP payload.
const MAX_DATAGRAM: usize = 65_507;

/// Messages of a packet in order, bundles expanded depth-first.
pub fn flatten(packet: OscPacket) -> Vec<OscMessage> {
    let mut out = Vec::new();
    flatten_into(packet, &mut out);
    out
}

fn flatten_into(packet: OscPacket, out: &mut Vec<OscMessage>) {
    match packet {
        OscPacket::Message(msg) => out.push(msg),
        OscPacket::Bundle(bundle) => {
            for inner in bundle.content {
                flatten_into(inner, out);
            }
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════
// OscReceiver
// ════════════════════════════════════════════════════════════════════════════

pub struct OscReceiver {
    socket: UdpSocket,
    buf:    Vec<u8>,
}

impl OscReceiver {
    pub async fn bind(addr: &str) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        debug!("listening for OSC on {}", socket.local_addr()?);
        Ok(OscReceiver { socket, buf: vec![0; MAX_DATAGRAM] })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> { self.socket.local_addr() }

    /// Wait for the next datagram and return its messages.  A datagram that
    /// is not valid OSC yields an empty list.
    pub async fn recv(&mut self) -> io::Result<Vec<OscMessage>> {
        let (len, from) = self.socket.recv_from(&mut self.buf).await?;
        match decoder::decode_udp(&self.buf[..len]) {
            Ok((_, packet)) => Ok(flatten(packet)),
            Err(e) => {
                warn!("dropping undecodable datagram ({len} bytes) from {from}: {e}");
                Ok(Vec::new())
            }
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════
// OscOut
// ════════════════════════════════════════════════════════════════════════════

pub struct OscOut {
    socket: StdUdpSocket,
    target: SocketAddr,
    prefix: String,
}

impl OscOut {
    /// Resolve `target` and bind an ephemeral local socket.
    pub fn connect(target: &str, prefix: &str) -> Result<Self, OutputError> {
        let target = target.to_socket_addrs()?
            .next()
            .ok_or_else(|| OutputError::NoPort(target.to_string()))?;
        let local = if target.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = StdUdpSocket::bind(local)?;
        tracing::info!("sending instrument OSC to {target}");
        Ok(OscOut {
            socket,
            target,
            prefix: prefix.trim_end_matches('/').to_string(),
        })
    }

    pub fn target(&self) -> SocketAddr { self.target }

    /// OSC message for a scheduler event.
    pub fn message_for(&self, event: &MidiEvent) -> OscMessage {
        let channel = OscType::Int(event.channel() as i32 + 1);
        let (name, args) = match *event {
            MidiEvent::PitchBend { value, .. } => {
                ("pitch_bend", vec![channel, OscType::Int(value as i32)])
            }
            MidiEvent::NoteOn { key, velocity, .. } => {
                ("note_on", vec![channel, OscType::Int(key as i32), OscType::Int(velocity as i32)])
            }
            MidiEvent::AllNotesOff { .. } => ("all_notes_off", vec![channel]),
        };
        OscMessage { addr: format!("{}/{name}", self.prefix), args }
    }
}

impl MidiOut for OscOut {
    fn send(&mut self, event: &MidiEvent) -> Result<(), OutputError> {
        let data = encoder::encode(&OscPacket::Message(self.message_for(event)))
            .map_err(|e| OutputError::Send { event: format!("{event:?}"), reason: e.to_string() })?;
        self.socket.send_to(&data, self.target)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rosc::{OscBundle, OscTime};
    use std::time::Duration;

    fn msg(addr: &str) -> OscPacket {
        OscPacket::Message(OscMessage { addr: addr.to_string(), args: vec![] })
    }

    fn bundle(content: Vec<OscPacket>) -> OscPacket {
        OscPacket::Bundle(OscBundle { timetag: OscTime { seconds: 0, fractional: 1 }, content })
    }

    #[test]
    fn bundles_flatten_in_order() {
        let packet = bundle(vec![msg("/a"), bundle(vec![msg("/b"), msg("/c")]), msg("/d")]);
        let addrs: Vec<_> = flatten(packet).into_iter().map(|m| m.addr).collect();
        assert_eq!(addrs, ["/a", "/b", "/c", "/d"]);
    }

    #[test]
    fn messages_use_one_based_channels() {
        let out = OscOut::connect("127.0.0.1:9", "/midi/").unwrap();
        let m = out.message_for(&MidiEvent::NoteOn { channel: 0, key: 60, velocity: 90 });
        assert_eq!(m.addr, "/midi/note_on");
        assert_eq!(m.args, vec![OscType::Int(1), OscType::Int(60), OscType::Int(90)]);

        let m = out.message_for(&MidiEvent::PitchBend { channel: 15, value: 12288 });
        assert_eq!(m.addr, "/midi/pitch_bend");
        assert_eq!(m.args, vec![OscType::Int(16), OscType::Int(12288)]);

        let m = out.message_for(&MidiEvent::AllNotesOff { channel: 3 });
        assert_eq!(m.addr, "/midi/all_notes_off");
        assert_eq!(m.args, vec![OscType::Int(4)]);
    }

    #[test]
    fn osc_out_reaches_listener() {
        let listener = StdUdpSocket::bind("127.0.0.1:0").unwrap();
        listener.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let mut out = OscOut::connect(&addr, "/synth").unwrap();
        assert_eq!(out.target(), listener.local_addr().unwrap());
        out.send(&MidiEvent::AllNotesOff { channel: 1 }).unwrap();

        let mut buf = [0u8; 1024];
        let (len, _) = listener.recv_from(&mut buf).unwrap();
        let (_, packet) = decoder::decode_udp(&buf[..len]).unwrap();
        let msgs = flatten(packet);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].addr, "/synth/all_notes_off");
        assert_eq!(msgs[0].args, vec![OscType::Int(2)]);
    }

    #[tokio::test]
    async fn receiver_decodes_and_drops_garbage() {
        let mut rx = OscReceiver::bind("127.0.0.1:0").await.unwrap();
        let addr = rx.local_addr().unwrap();
        let sender = StdUdpSocket::bind("127.0.0.1:0").unwrap();

        sender.send_to(b"not osc", addr).unwrap();
        assert!(rx.recv().await.unwrap().is_empty());

        let data = encoder::encode(&bundle(vec![msg("/x"), msg("/y")])).unwrap();
        sender.send_to(&data, addr).unwrap();
        let msgs = rx.recv().await.unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[1].addr, "/y");
    }
}
