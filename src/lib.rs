//! gridlink is a client-side core for the Second Life / OpenSimulator protocol
//!  family. It maintains UDP circuits with simulator servers, exchanges the
//!  strongly-typed message catalogue over an unreliable datagram transport with
//!  application-level reliability, and exposes a dispatch surface that
//!  higher-level features (movement, inventory, chat, asset transfer) build on.
//!
//! The main pieces:
//!
//! * [`template`] - the message dictionary parsed from the template manifest,
//!    and the generator that renders codec source from it
//! * [`messages`] - the typed message catalogue with encode / decode / length /
//!    MTU-splitting per message
//! * [`wire`] - datagram headers, appended acks, zero-coding and the primitive
//!    field codec
//! * [`circuit`] - the circuit engine: sequencing, retransmission, duplicate
//!    detection, ack piggybacking, liveness and throttling
//! * [`dispatch`] - packet-type and capability-event callback registries
//! * [`osd`] - the structured-data value model used by capability traffic, with
//!    its four interchangeable serializations
//! * [`bitpack`] - the sub-byte packer used by terrain and texture layer data

pub mod bitpack;
pub mod circuit;
pub mod dispatch;
pub mod error;
pub mod messages;
pub mod osd;
pub mod template;
pub mod types;
pub mod wire;

pub use error::{GridError, Result};

#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
