//! Named, stream-wide message channels layered on every peer session.
//!
//! Definitions live in one namespace per networker. Registering a name again replaces
//! the stored definition: sessions attached afterwards bind the new one, while sessions
//! that already bound the name keep their binding. Handles look the name up on every
//! send instead of holding a definition.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, trace};

use crate::error::{NetworkerError, Result};
use crate::peer::Peer;

/// Wire encoding of an extension's payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Encoding {
    Binary,
    Utf8,
    Json,
}

impl Encoding {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Binary => "binary",
            Self::Utf8 => "utf-8",
            Self::Json => "json",
        }
    }

    pub fn encode(&self, message: &ExtensionMessage) -> Result<Vec<u8>> {
        match (self, message) {
            (Self::Binary, ExtensionMessage::Binary(bytes)) => Ok(bytes.to_vec()),
            (Self::Binary | Self::Utf8, ExtensionMessage::Text(text)) => Ok(text.as_bytes().to_vec()),
            (Self::Utf8, ExtensionMessage::Binary(bytes)) => std::str::from_utf8(bytes)
                .map(|text| text.as_bytes().to_vec())
                .map_err(|e| self.error(e)),
            (Self::Json, ExtensionMessage::Json(value)) => {
                serde_json::to_vec(value).map_err(|e| self.error(e))
            }
            (Self::Json, ExtensionMessage::Text(text)) => {
                serde_json::to_vec(&Value::String(text.clone())).map_err(|e| self.error(e))
            }
            (_, other) => Err(self.error(format!("cannot encode {} payload", other.kind()))),
        }
    }

    pub fn decode(&self, payload: &[u8]) -> Result<ExtensionMessage> {
        match self {
            Self::Binary => Ok(ExtensionMessage::Binary(Bytes::copy_from_slice(payload))),
            Self::Utf8 => String::from_utf8(payload.to_vec())
                .map(ExtensionMessage::Text)
                .map_err(|e| self.error(e)),
            Self::Json => serde_json::from_slice(payload)
                .map(ExtensionMessage::Json)
                .map_err(|e| self.error(e)),
        }
    }

    fn error(&self, reason: impl ToString) -> NetworkerError {
        NetworkerError::Encoding {
            encoding: self.as_str(),
            reason: reason.to_string(),
        }
    }
}

impl FromStr for Encoding {
    type Err = NetworkerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "binary" | "raw" | "bytes" => Ok(Self::Binary),
            "utf8" | "utf-8" | "text" => Ok(Self::Utf8),
            "json" => Ok(Self::Json),
            _ => Err(NetworkerError::UnknownEncoding(s.to_owned())),
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded extension payload.
#[derive(Debug, Clone, PartialEq)]
pub enum ExtensionMessage {
    Binary(Bytes),
    Text(String),
    Json(Value),
}

impl ExtensionMessage {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Self::Json(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Self::Binary(bytes) => Some(bytes),
            _ => None,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Binary(_) => "binary",
            Self::Text(_) => "text",
            Self::Json(_) => "json",
        }
    }
}

impl From<Bytes> for ExtensionMessage {
    fn from(bytes: Bytes) -> Self {
        Self::Binary(bytes)
    }
}

impl From<Vec<u8>> for ExtensionMessage {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Binary(Bytes::from(bytes))
    }
}

impl From<String> for ExtensionMessage {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for ExtensionMessage {
    fn from(text: &str) -> Self {
        Self::Text(text.to_owned())
    }
}

impl From<Value> for ExtensionMessage {
    fn from(value: Value) -> Self {
        Self::Json(value)
    }
}

/// Receives decoded messages together with the peer they came from.
pub trait ExtensionHandler: Send + Sync + 'static {
    fn on_message(&self, message: ExtensionMessage, peer: &Peer);
}

impl<F> ExtensionHandler for F
where
    F: Fn(ExtensionMessage, &Peer) + Send + Sync + 'static,
{
    fn on_message(&self, message: ExtensionMessage, peer: &Peer) {
        (self)(message, peer)
    }
}

/// An encoding paired with a handler.
#[derive(Clone)]
pub struct ExtensionDefinition {
    encoding: Encoding,
    handler: Arc<dyn ExtensionHandler>,
}

impl ExtensionDefinition {
    pub fn new(encoding: Encoding, handler: impl ExtensionHandler) -> Self {
        Self {
            encoding,
            handler: Arc::new(handler),
        }
    }

    /// Like [`new`](Self::new), with the encoding given by name.
    pub fn parse(encoding: &str, handler: impl ExtensionHandler) -> Result<Self> {
        Ok(Self::new(encoding.parse()?, handler))
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    pub(crate) fn binding(&self) -> ExtensionBinding {
        ExtensionBinding {
            encoding: self.encoding,
            handler: Arc::clone(&self.handler),
        }
    }
}

impl fmt::Debug for ExtensionDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtensionDefinition")
            .field("encoding", &self.encoding)
            .finish_non_exhaustive()
    }
}

/// Builds a fresh definition for every peer the extension attaches to.
pub trait ExtensionFactory: Send + Sync + 'static {
    fn create(&self, peer: &Peer) -> ExtensionDefinition;
}

impl<F> ExtensionFactory for F
where
    F: Fn(&Peer) -> ExtensionDefinition + Send + Sync + 'static,
{
    fn create(&self, peer: &Peer) -> ExtensionDefinition {
        (self)(peer)
    }
}

/// A definition bound to one session.
pub(crate) struct ExtensionBinding {
    encoding: Encoding,
    handler: Arc<dyn ExtensionHandler>,
}

impl ExtensionBinding {
    pub(crate) fn encoding(&self) -> Encoding {
        self.encoding
    }

    pub(crate) fn deliver(&self, name: &str, payload: Vec<u8>, peer: &Peer) {
        match self.encoding.decode(&payload) {
            Ok(message) => self.handler.on_message(message, peer),
            Err(err) => {
                debug!(%name, peer = %peer.remote_public_key().short(), %err, "undecodable extension message dropped")
            }
        }
    }
}

#[derive(Clone)]
enum Registration {
    Shared(ExtensionDefinition),
    Factory(Arc<dyn ExtensionFactory>),
}

impl Registration {
    fn bind(&self, peer: &Peer) -> ExtensionBinding {
        match self {
            Self::Shared(definition) => definition.binding(),
            Self::Factory(factory) => factory.create(peer).binding(),
        }
    }
}

#[derive(Default)]
pub(crate) struct ExtensionRegistry {
    entries: RwLock<HashMap<String, Registration>>,
}

impl ExtensionRegistry {
    /// Store `definition` under `name`, then bind it to the peers `live` returns that have
    /// no binding for `name` yet.
    pub(crate) fn register(
        &self,
        name: &str,
        definition: ExtensionDefinition,
        live: impl FnOnce() -> Vec<Peer>,
    ) {
        self.insert(name, Registration::Shared(definition), live);
    }

    pub(crate) fn register_factory(
        &self,
        name: &str,
        factory: Arc<dyn ExtensionFactory>,
        live: impl FnOnce() -> Vec<Peer>,
    ) {
        self.insert(name, Registration::Factory(factory), live);
    }

    // peers are listed after the entry is stored so a concurrently admitted peer is
    // bound by one side or the other
    fn insert(&self, name: &str, registration: Registration, live: impl FnOnce() -> Vec<Peer>) {
        let replaced = self
            .entries
            .write()
            .insert(name.to_owned(), registration.clone())
            .is_some();
        trace!(%name, replaced, "extension registered");

        for peer in live() {
            if peer.session().has_extension(name) {
                continue;
            }
            let binding = Arc::new(registration.bind(&peer));
            peer.session().bind_extension(name, binding, false);
        }
    }

    /// Bind every registered extension to a newly admitted peer.
    pub(crate) fn bind_peer(&self, peer: &Peer) {
        let entries: Vec<(String, Registration)> = self
            .entries
            .read()
            .iter()
            .map(|(name, registration)| (name.clone(), registration.clone()))
            .collect();
        for (name, registration) in entries {
            let binding = Arc::new(registration.bind(peer));
            peer.session().bind_extension(&name, binding, true);
        }
    }

    /// Encoding for sending on `name` to `peer`: the registered definition's, or the
    /// peer's own binding for factory registrations. A factory registration the peer has
    /// not been bound to yet is bound here.
    pub(crate) fn encoding_for(&self, name: &str, peer: &Peer) -> Option<Encoding> {
        let registration = self.entries.read().get(name)?.clone();
        match registration {
            Registration::Shared(definition) => Some(definition.encoding()),
            Registration::Factory(factory) => {
                if let Some(binding) = peer.session().extension(name) {
                    return Some(binding.encoding());
                }
                let binding = Arc::new(factory.create(peer).binding());
                if peer.session().bind_extension(name, Arc::clone(&binding), false) {
                    trace!(%name, peer = %peer.remote_public_key().short(), "extension bound on send");
                    return Some(binding.encoding());
                }
                peer.session().extension(name).map(|binding| binding.encoding())
            }
        }
    }

    pub(crate) fn contains(&self, name: &str) -> bool {
        self.entries.read().contains_key(name)
    }

    pub(crate) fn names(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }
}

impl fmt::Debug for ExtensionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtensionRegistry")
            .field("names", &self.names())
            .finish()
    }
}

/// Sends on a registered extension.
#[derive(Clone)]
pub struct ExtensionHandle {
    name: Arc<str>,
    registry: Arc<ExtensionRegistry>,
}

impl ExtensionHandle {
    pub(crate) fn new(name: &str, registry: Arc<ExtensionRegistry>) -> Self {
        Self {
            name: Arc::from(name),
            registry,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Encode `message` and queue it on `peer`'s session. Does not wait for delivery.
    pub fn send(&self, message: impl Into<ExtensionMessage>, peer: &Peer) -> Result<()> {
        if peer.is_closed() {
            return Err(NetworkerError::UnknownPeer(peer.remote_public_key()));
        }
        let encoding = self
            .registry
            .encoding_for(&self.name, peer)
            .ok_or_else(|| NetworkerError::UnknownExtension(self.name.to_string()))?;
        let payload = encoding.encode(&message.into())?;
        peer.session().send_extension(&self.name, payload)
    }
}

impl fmt::Debug for ExtensionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtensionHandle")
            .field("name", &self.name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_encoding_from_str() {
        assert_eq!("utf-8".parse::<Encoding>().unwrap(), Encoding::Utf8);
        assert_eq!("UTF8".parse::<Encoding>().unwrap(), Encoding::Utf8);
        assert_eq!("json".parse::<Encoding>().unwrap(), Encoding::Json);
        assert_eq!("binary".parse::<Encoding>().unwrap(), Encoding::Binary);
        assert!(matches!(
            "protobuf".parse::<Encoding>(),
            Err(NetworkerError::UnknownEncoding(name)) if name == "protobuf"
        ));
    }

    #[test]
    fn test_parse_definition_rejects_unknown_encoding() {
        let result = ExtensionDefinition::parse("yaml", |_: ExtensionMessage, _: &Peer| {});
        assert!(matches!(result, Err(NetworkerError::UnknownEncoding(_))));
    }

    #[test]
    fn test_utf8() {
        let bytes = Encoding::Utf8.encode(&"hello".into()).unwrap();
        assert_eq!(bytes, b"hello");
        assert_eq!(Encoding::Utf8.decode(&bytes).unwrap().as_text(), Some("hello"));
        assert!(Encoding::Utf8.decode(&[0xff, 0xfe]).is_err());
        assert!(Encoding::Utf8.encode(&json!({"a": 1}).into()).is_err());
    }

    #[test]
    fn test_json() {
        let value = json!({ "message": "hello" });
        let bytes = Encoding::Json.encode(&value.clone().into()).unwrap();
        assert_eq!(Encoding::Json.decode(&bytes).unwrap().as_json(), Some(&value));
        assert!(Encoding::Json.decode(b"{not json").is_err());
    }

    #[tokio::test]
    async fn test_factory_binds_on_first_send() {
        use chainnet_net_transport::Role;
        use chainnet_primitives::PublicKey;

        use crate::replicator::NoopReplicator;
        use crate::session::Session;

        let remote = PublicKey::new([2; 32]);
        let (session, _io) = Session::new(remote, Arc::new(NoopReplicator), 1024);
        let peer = Peer::new(remote, PublicKey::new([1; 32]), Role::Initiator, 1, session);

        let registry = Arc::new(ExtensionRegistry::default());
        let created = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = Arc::clone(&created);
        // registered while the peer is unknown to the registry
        registry.register_factory(
            "late",
            Arc::new(move |_: &Peer| {
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                ExtensionDefinition::new(Encoding::Utf8, |_: ExtensionMessage, _: &Peer| {})
            }),
            Vec::new,
        );
        assert!(!peer.session().has_extension("late"));

        let handle = ExtensionHandle::new("late", Arc::clone(&registry));
        handle.send("hi", &peer).unwrap();
        handle.send("again", &peer).unwrap();
        assert!(peer.session().has_extension("late"));
        assert_eq!(created.load(std::sync::atomic::Ordering::SeqCst), 1);

        let missing = ExtensionHandle::new("missing", registry);
        assert!(matches!(
            missing.send("hi", &peer),
            Err(NetworkerError::UnknownExtension(name)) if name == "missing"
        ));
    }

    #[test]
    fn test_binary() {
        let payload = Bytes::from_static(&[0, 1, 2, 255]);
        let bytes = Encoding::Binary.encode(&payload.clone().into()).unwrap();
        assert_eq!(
            Encoding::Binary.decode(&bytes).unwrap().as_bytes(),
            Some(&payload)
        );
        assert!(Encoding::Binary.encode(&json!(null).into()).is_err());
    }
}
