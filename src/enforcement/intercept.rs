//! Packet interception boundary.
//!
//! - Windows: WinDivert 2.x (`windivert` crate)
//! - elsewhere: interception is reported unavailable

use std::time::Duration;

use crate::error::{EngineError, EngineResult};

/// Result of waiting for the next intercepted packet.
#[derive(Debug)]
pub enum Received<P> {
    Packet(P),
    Timeout,
    Closed,
}

/// An open interception handle. Packets not forwarded are dropped.
pub trait InterceptHandle: Send {
    type Packet: AsRef<[u8]> + Send;

    fn recv(&mut self, timeout: Duration) -> EngineResult<Received<Self::Packet>>;

    /// Re-inject a packet unchanged.
    fn forward(&mut self, packet: Self::Packet) -> EngineResult<()>;

    fn close(&mut self);
}

/// Opens interception handles for a driver filter expression.
pub trait Interceptor: Send + Sync + 'static {
    type Handle: InterceptHandle + 'static;

    fn open(&self, filter: &str) -> EngineResult<Self::Handle>;
}

/// Interceptor for platforms without a packet diversion driver.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableInterceptor;

/// Handle type that can never be constructed.
#[derive(Debug)]
pub enum NoHandle {}

impl InterceptHandle for NoHandle {
    type Packet = Vec<u8>;

    fn recv(&mut self, _timeout: Duration) -> EngineResult<Received<Vec<u8>>> {
        match *self {}
    }

    fn forward(&mut self, _packet: Vec<u8>) -> EngineResult<()> {
        match *self {}
    }

    fn close(&mut self) {
        match *self {}
    }
}

impl Interceptor for UnavailableInterceptor {
    type Handle = NoHandle;

    fn open(&self, _filter: &str) -> EngineResult<NoHandle> {
        Err(EngineError::Interception(
            "packet interception is not supported on this platform".into(),
        ))
    }
}

#[cfg(target_os = "windows")]
pub use windivert_backend::WinDivertInterceptor as PlatformInterceptor;

#[cfg(not(target_os = "windows"))]
pub use UnavailableInterceptor as PlatformInterceptor;

#[cfg(target_os = "windows")]
mod windivert_backend {
    use super::{InterceptHandle, Interceptor, Received};
    use crate::error::{EngineError, EngineResult};
    use std::time::Duration;
    use tracing::{error, info};
    use windivert::error::WinDivertError;
    use windivert::layer::NetworkLayer;
    use windivert::packet::WinDivertPacket;
    use windivert::prelude::*;

    #[derive(Debug, Default, Clone, Copy)]
    pub struct WinDivertInterceptor;

    /// Owned packet together with the address WinDivert needs to re-inject it.
    pub struct DivertedPacket(WinDivertPacket<'static, NetworkLayer>);

    impl AsRef<[u8]> for DivertedPacket {
        fn as_ref(&self) -> &[u8] {
            &self.0.data
        }
    }

    pub struct WinDivertHandle {
        wd: Option<WinDivert<NetworkLayer>>,
        buf: Vec<u8>,
    }

    impl Interceptor for WinDivertInterceptor {
        type Handle = WinDivertHandle;

        fn open(&self, filter: &str) -> EngineResult<WinDivertHandle> {
            // Default flags: intercept mode, packets are held until re-injected.
            let wd = WinDivert::network(filter, 0, WinDivertFlags::new()).map_err(|e| {
                error!("WinDivert::network() failed: {e:?}");
                EngineError::Interception(format!(
                    "failed to open WinDivert handle (filter={filter}): {e:?}. \
                     Ensure WinDivert.dll and WinDivert64.sys are next to the executable \
                     and the program runs as Administrator"
                ))
            })?;
            info!("WinDivert handle opened with filter: {filter}");
            Ok(WinDivertHandle {
                wd: Some(wd),
                buf: vec![0u8; 65535],
            })
        }
    }

    impl InterceptHandle for WinDivertHandle {
        type Packet = DivertedPacket;

        fn recv(&mut self, timeout: Duration) -> EngineResult<Received<Self::Packet>> {
            let Some(wd) = self.wd.as_ref() else {
                return Ok(Received::Closed);
            };
            let timeout_ms = u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX);
            match wd.recv_wait(Some(&mut self.buf), timeout_ms) {
                Ok(packet) => Ok(Received::Packet(DivertedPacket(packet.into_owned()))),
                Err(WinDivertError::Timeout) => Ok(Received::Timeout),
                Err(e) => Err(EngineError::Interception(format!("WinDivert recv error: {e}"))),
            }
        }

        fn forward(&mut self, packet: Self::Packet) -> EngineResult<()> {
            let Some(wd) = self.wd.as_ref() else {
                return Err(EngineError::Interception("handle is closed".into()));
            };
            wd.send(&packet.0)
                .map(|_| ())
                .map_err(|e| EngineError::Interception(format!("WinDivert send error: {e}")))
        }

        fn close(&mut self) {
            if let Some(mut wd) = self.wd.take() {
                if let Err(e) = wd.close(CloseAction::Nothing) {
                    error!("WinDivert close error: {e}");
                }
                info!("WinDivert handle closed");
            }
        }
    }

    impl Drop for WinDivertHandle {
        fn drop(&mut self) {
            self.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_interceptor_reports_interception_error() {
        let err = UnavailableInterceptor.open("outbound").unwrap_err();
        assert_eq!(err.kind(), "Interception");
    }
}
