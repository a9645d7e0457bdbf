//! Per-session payload encryption.
//!
//! AES-256-ECB over the RTP payload only; the header stays in clear so
//! transports and the collector can still route on it. ECB is retained for
//! wire compatibility with deployed peers.
//! TODO: move to AES-GCM once the server can negotiate the cipher per
//! conference.
//!
//! The key is the raw byte string of the conference `secure_key`, zero-padded
//! or truncated to the 32 bytes AES-256 takes.

use aes::Aes256;
use ecb::cipher::block_padding::Pkcs7;
use ecb::cipher::{BlockDecryptMut, BlockEncryptMut, KeyInit};
use parking_lot::Mutex;
use tracing::error;

use confero_transport_core::socket::{Packet, PacketSink, SharedSink};
use confero_transport_core::{Address, RtpPacket};

type Aes256EcbEncryptor = ecb::Encryptor<Aes256>;
type Aes256EcbDecryptor = ecb::Decryptor<Aes256>;

fn session_key(secure_key: &str) -> [u8; 32] {
    let mut key = [0u8; 32];
    let bytes = secure_key.as_bytes();
    let len = bytes.len().min(32);
    key[..len].copy_from_slice(&bytes[..len]);
    key
}

struct CipherState {
    key: [u8; 32],
    receiver: Option<SharedSink>,
    runned: bool,
}

/// Encrypting pipeline stage for the send path.
pub struct Encryptor {
    state: Mutex<CipherState>,
}

impl Encryptor {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CipherState { key: [0; 32], receiver: None, runned: false }),
        }
    }

    pub fn set_receiver(&self, receiver: Option<SharedSink>) {
        self.state.lock().receiver = receiver;
    }

    pub fn start(&self, secure_key: &str) {
        let mut state = self.state.lock();
        state.key = session_key(secure_key);
        state.runned = true;
    }

    pub fn stop(&self) {
        self.state.lock().runned = false;
    }

    pub fn is_started(&self) -> bool {
        self.state.lock().runned
    }
}

impl Default for Encryptor {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketSink for Encryptor {
    fn send_packet(&self, packet: Packet, addr: Option<&Address>) {
        let (key, receiver, runned) = {
            let state = self.state.lock();
            (state.key, state.receiver.clone(), state.runned)
        };
        if !runned {
            return;
        }
        let Some(receiver) = receiver else { return };

        match packet {
            Packet::Rtp(packet) => {
                let ciphertext = Aes256EcbEncryptor::new((&key).into())
                    .encrypt_padded_vec_mut::<Pkcs7>(&packet.payload);
                receiver.send_packet(
                    Packet::Rtp(RtpPacket::new(packet.header, ciphertext.into())),
                    addr,
                );
            }
            // RTCP control packets travel in clear.
            other => receiver.send_packet(other, addr),
        }
    }
}

/// Decrypting pipeline stage for the receive path. Packets that fail to
/// decrypt are dropped and logged.
pub struct Decryptor {
    state: Mutex<CipherState>,
}

impl Decryptor {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CipherState { key: [0; 32], receiver: None, runned: false }),
        }
    }

    pub fn set_receiver(&self, receiver: Option<SharedSink>) {
        self.state.lock().receiver = receiver;
    }

    pub fn start(&self, secure_key: &str) {
        let mut state = self.state.lock();
        state.key = session_key(secure_key);
        state.runned = true;
    }

    pub fn stop(&self) {
        self.state.lock().runned = false;
    }

    pub fn is_started(&self) -> bool {
        self.state.lock().runned
    }
}

impl Default for Decryptor {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketSink for Decryptor {
    fn send_packet(&self, packet: Packet, addr: Option<&Address>) {
        let (key, receiver, runned) = {
            let state = self.state.lock();
            (state.key, state.receiver.clone(), state.runned)
        };
        if !runned {
            return;
        }
        let Some(receiver) = receiver else { return };

        match packet {
            Packet::Rtp(packet) => {
                match Aes256EcbDecryptor::new((&key).into())
                    .decrypt_padded_vec_mut::<Pkcs7>(&packet.payload)
                {
                    Ok(plaintext) => receiver.send_packet(
                        Packet::Rtp(RtpPacket::new(packet.header, plaintext.into())),
                        addr,
                    ),
                    Err(_) => {
                        error!("Decryptor :: dropped packet, ssrc: {}, seq: {}", packet.header.ssrc, packet.header.seq)
                    }
                }
            }
            other => receiver.send_packet(other, addr),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use confero_transport_core::socket::FnSink;
    use confero_transport_core::RtpHeader;
    use std::sync::Arc;

    fn collect() -> (SharedSink, Arc<Mutex<Vec<RtpPacket>>>) {
        let collected = Arc::new(Mutex::new(Vec::new()));
        let sink_collected = collected.clone();
        let sink: SharedSink = Arc::new(FnSink(move |packet, _| {
            if let Packet::Rtp(p) = packet {
                sink_collected.lock().push(p);
            }
        }));
        (sink, collected)
    }

    #[test]
    fn encrypt_decrypt_round_trip_any_length() {
        for len in [0usize, 1, 15, 16, 17, 160, 1200] {
            let payload: Vec<u8> = (0..len).map(|i| i as u8).collect();

            let encryptor = Encryptor::new();
            let (enc_sink, encrypted) = collect();
            encryptor.set_receiver(Some(enc_sink));
            encryptor.start("conference-secure-key");

            encryptor.send_packet(
                Packet::Rtp(RtpPacket::new(RtpHeader::default(), Bytes::from(payload.clone()))),
                None,
            );

            let ciphertext = encrypted.lock().pop().unwrap();
            // PKCS#7 always pads up to the next whole block.
            assert_eq!(ciphertext.payload.len(), (len / 16 + 1) * 16);

            let decryptor = Decryptor::new();
            let (dec_sink, decrypted) = collect();
            decryptor.set_receiver(Some(dec_sink));
            decryptor.start("conference-secure-key");
            decryptor.send_packet(Packet::Rtp(ciphertext), None);

            assert_eq!(decrypted.lock().pop().unwrap().payload, Bytes::from(payload));
        }
    }

    #[test]
    fn wrong_key_drops_packet() {
        let encryptor = Encryptor::new();
        let (enc_sink, encrypted) = collect();
        encryptor.set_receiver(Some(enc_sink));
        encryptor.start("key-a");
        encryptor.send_packet(
            Packet::Rtp(RtpPacket::new(RtpHeader::default(), Bytes::from_static(b"secret"))),
            None,
        );

        let decryptor = Decryptor::new();
        let (dec_sink, decrypted) = collect();
        decryptor.set_receiver(Some(dec_sink));
        decryptor.start("key-b");
        decryptor.send_packet(Packet::Rtp(encrypted.lock().pop().unwrap()), None);

        assert!(decrypted.lock().is_empty());
    }

    #[test]
    fn stopped_stage_swallows_packets() {
        let encryptor = Encryptor::new();
        let (enc_sink, encrypted) = collect();
        encryptor.set_receiver(Some(enc_sink));
        encryptor.send_packet(
            Packet::Rtp(RtpPacket::new(RtpHeader::default(), Bytes::from_static(b"x"))),
            None,
        );
        assert!(encrypted.lock().is_empty());
    }
}
