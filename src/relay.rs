//! The relay protocol spoken with a graphical login manager.
//!
//! Instead of prompting the user itself, the module can let the login manager render the whole
//! authentication UI. Both sides then exchange JSON [`Envelope`]s, framed by the [`RelayCodec`]
//! into binary messages that travel through the PAM binary prompt. The prompt is strictly
//! request/reply, so the module polls the peer for the events it queued.

#[allow(unsafe_code)]
mod codec;
pub use codec::{BinaryMessage, CodecError, JSON_PROTOCOL, PROTOCOL_NAME_LEN, ProtocolInfo, RelayCodec};

mod envelope;
pub use envelope::{Envelope, EnvelopeError, Event, PROTOCOL_VERSION, Request, Response};

mod error;
pub use error::{RelayError, RelayErrorKind};

mod extensions;
pub use extensions::{JSON_EXTENSION, SUPPORTED_EXTENSIONS_ENV, SupportedExtensions};

mod transport;
pub(crate) use transport::RelayClient;
pub use transport::RelayTransport;
