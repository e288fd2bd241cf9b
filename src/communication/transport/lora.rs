//! LoRa transport
//!
//! A LoRa link has no session: once the radio is up every send is a single
//! broadcast packet. Device log lines are not carried; they stay local.

use super::{Route, Transport, TransportError};
use crate::log_warn;
use crate::parameters::network::LoRaConfig;
use core::fmt;
use embassy_sync::channel::Channel;

/// Largest payload one LoRa packet carries
pub const LORA_MAX_PACKET: usize = 255;

/// Receive buffer size for one inbound packet
pub const LORA_PACKET_BUF: usize = 256;

/// Inbound packets buffered between the radio callback and the pump task
pub const LORA_INBOUND_QUEUE_SIZE: usize = 10;

/// One received LoRa packet
pub type LoRaPacket = heapless::Vec<u8, LORA_PACKET_BUF>;

/// Channel the radio receive callback posts packets to
pub type LoRaInboundChannel<M> = Channel<M, LoRaPacket, LORA_INBOUND_QUEUE_SIZE>;

/// External LoRa radio driver
#[allow(async_fn_in_trait)]
pub trait LoRaRadio {
    type Error: fmt::Debug;

    /// One-time radio bring-up (SPI pins, reset, carrier frequency)
    fn begin(&mut self, config: &LoRaConfig) -> Result<(), Self::Error>;

    /// Transmit one packet
    async fn transmit(&mut self, packet: &[u8]) -> Result<(), Self::Error>;
}

/// [`Transport`] over a LoRa radio
pub struct LoRaTransport<R: LoRaRadio> {
    radio: R,
}

impl<R: LoRaRadio> LoRaTransport<R> {
    /// Bring the radio up
    ///
    /// There is no retry: a failure here leaves the node without a link.
    pub fn begin(mut radio: R, config: &LoRaConfig) -> Result<Self, R::Error> {
        radio.begin(config)?;
        Ok(Self { radio })
    }

    pub fn radio(&self) -> &R {
        &self.radio
    }

    pub fn radio_mut(&mut self) -> &mut R {
        &mut self.radio
    }
}

impl<R: LoRaRadio> Transport for LoRaTransport<R> {
    fn is_usable(&self) -> bool {
        true
    }

    fn carries(&self, route: Route) -> bool {
        route != Route::Log
    }

    fn max_payload(&self) -> Option<usize> {
        Some(LORA_MAX_PACKET)
    }

    async fn send(&mut self, route: Route, payload: &[u8]) -> Result<(), TransportError> {
        if !self.carries(route) {
            return Err(TransportError::Unsupported);
        }
        if payload.len() > LORA_MAX_PACKET {
            return Err(TransportError::PayloadTooLarge);
        }

        self.radio.transmit(payload).await.map_err(|e| {
            log_warn!("LoRa transmit failed: {:?}", e);
            TransportError::Io
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::communication::transport::mock::MockRadio;

    #[test]
    fn test_begin_failure() {
        let mut radio = MockRadio::new();
        radio.set_begin_ok(false);
        assert!(LoRaTransport::begin(radio, &LoRaConfig::default()).is_err());
    }

    #[test]
    fn test_begin_passes_config() {
        let config = LoRaConfig {
            frequency_hz: 868_000_000,
            ..LoRaConfig::default()
        };
        let transport = LoRaTransport::begin(MockRadio::new(), &config).unwrap();
        assert_eq!(transport.radio().frequency_hz(), Some(868_000_000));
        assert!(transport.is_usable());
        assert_eq!(transport.max_payload(), Some(LORA_MAX_PACKET));
    }

    #[tokio::test]
    async fn test_send_transmits_packet() {
        let mut transport = LoRaTransport::begin(MockRadio::new(), &LoRaConfig::default()).unwrap();
        transport.send(Route::Confirmation, b"ack").await.unwrap();
        transport.send(Route::Registry, b"cat").await.unwrap();

        assert_eq!(transport.radio().transmitted(), [b"ack".to_vec(), b"cat".to_vec()]);
    }

    #[tokio::test]
    async fn test_log_route_not_carried() {
        let mut transport = LoRaTransport::begin(MockRadio::new(), &LoRaConfig::default()).unwrap();
        assert!(!transport.carries(Route::Log));
        assert_eq!(
            transport.send(Route::Log, b"line").await,
            Err(TransportError::Unsupported)
        );
        assert!(transport.radio().transmitted().is_empty());
    }

    #[tokio::test]
    async fn test_oversized_packet_rejected() {
        let mut transport = LoRaTransport::begin(MockRadio::new(), &LoRaConfig::default()).unwrap();
        let payload = [b'x'; LORA_MAX_PACKET + 1];
        assert_eq!(
            transport.send(Route::Registry, &payload).await,
            Err(TransportError::PayloadTooLarge)
        );
    }

    #[tokio::test]
    async fn test_transmit_failure_maps_to_io() {
        let mut transport = LoRaTransport::begin(MockRadio::new(), &LoRaConfig::default()).unwrap();
        transport.radio_mut().set_transmit_ok(false);
        assert_eq!(
            transport.send(Route::Confirmation, b"ack").await,
            Err(TransportError::Io)
        );
    }
}
