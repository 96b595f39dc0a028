//! Replica: one local copy of the shared object space.
//!
//! Layout inside the Yrs document:
//! ```text
//! Doc
//! ├── map "objects"
//! │     ├── "/TodoItem#a1" → map  { _type, textID, complete }
//! │     └── "/Text#a1"     → text "Buy milk"
//! └── array "/TodoList#todos" → [ "/TodoItem#a1", ... ]
//! ```
//!
//! Objects never leave the document. Wrappers in [`crate::model`] hold Yrs
//! handles and every read goes through a transaction, so all references are
//! lookups against the same shared space.
//!
//! Updates applied from the network are tagged with a remote origin. Engine
//! observers use that tag to tell local from remote deliveries, and the
//! outbound [`UpdateFeed`] uses it to avoid echoing remote updates back.

use thiserror::Error;
use tokio::sync::mpsc;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{
    Any, Doc, Map, MapPrelim, MapRef, Origin, Out, ReadTxn, StateVector, Subscription,
    TextPrelim, TextRef, Transact, Transaction, TransactionMut, Update,
};

use crate::ids::ObjectId;
use crate::model::{FieldValue, Schema};

/// Root map holding every replicated object by full identifier.
const OBJECTS_ROOT: &str = "objects";

/// Reserved field carrying a schema object's type name.
pub const TYPE_FIELD: &str = "_type";

/// Transaction origin for updates received from other replicas.
const REMOTE_ORIGIN: &str = "remote";

#[derive(Error, Debug)]
pub enum ReplicaError {
    #[error("malformed engine payload: {0}")]
    Decode(String),
    #[error("engine rejected update: {0}")]
    Apply(String),
    #[error("document busy: {0}")]
    Busy(String),
}

/// Where a delivered change came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOrigin {
    Local,
    Remote,
}

impl DeliveryOrigin {
    pub fn of(txn: &TransactionMut) -> Self {
        match txn.origin() {
            Some(origin) if *origin == Origin::from(REMOTE_ORIGIN) => Self::Remote,
            _ => Self::Local,
        }
    }
}

/// Sink that engine observers push deliveries into.
pub type DeliverySender = mpsc::UnboundedSender<DeliveryOrigin>;

/// An object looked up by identifier.
#[derive(Debug, Clone)]
pub enum ObjectRef {
    /// Schema object (fields in a Yrs map).
    Model(MapRef),
    /// Mergeable text.
    Text(TextRef),
}

/// Handle to a replica's document. Clones share the same document.
#[derive(Clone)]
pub struct Replica {
    doc: Doc,
    objects: MapRef,
}

impl Default for Replica {
    fn default() -> Self {
        Self::new()
    }
}

impl Replica {
    pub fn new() -> Self {
        Self::from_doc(Doc::new())
    }

    pub fn from_doc(doc: Doc) -> Self {
        let objects = doc.get_or_insert_map(OBJECTS_ROOT);
        Self { doc, objects }
    }

    pub fn doc(&self) -> &Doc {
        &self.doc
    }

    pub fn read(&self) -> Transaction<'_> {
        self.doc.transact()
    }

    /// Open a local write transaction. Observers fire when it is dropped.
    pub fn write(&self) -> TransactionMut<'_> {
        self.doc.transact_mut()
    }

    /// Look up an object by identifier.
    pub fn get<T: ReadTxn>(&self, txn: &T, id: &ObjectId) -> Option<ObjectRef> {
        match self.objects.get(txn, id.as_str())? {
            Out::YMap(map) => Some(ObjectRef::Model(map)),
            Out::YText(text) => Some(ObjectRef::Text(text)),
            _ => None,
        }
    }

    /// Create a schema object with every field set to its default.
    pub fn create_model(&self, txn: &mut TransactionMut, id: &ObjectId, schema: &Schema) -> MapRef {
        let map = self.objects.insert(txn, id.as_str(), MapPrelim::default());
        map.insert(txn, TYPE_FIELD, schema.type_name.to_string());
        for field in schema.fields {
            match field.default {
                FieldValue::Bool(b) => {
                    map.insert(txn, field.name, b);
                }
                FieldValue::Str(s) => {
                    map.insert(txn, field.name, s.to_string());
                }
            }
        }
        map
    }

    pub fn create_text(&self, txn: &mut TransactionMut, id: &ObjectId, value: &str) -> TextRef {
        self.objects.insert(txn, id.as_str(), TextPrelim::new(value))
    }

    /// Number of objects in the shared space, live or orphaned.
    pub fn object_count(&self) -> u32 {
        let txn = self.doc.transact();
        self.objects.len(&txn)
    }

    /// Apply an update produced by another replica.
    pub fn apply_remote_update(&self, update: &[u8]) -> Result<(), ReplicaError> {
        let update = Update::decode_v1(update).map_err(|e| ReplicaError::Decode(e.to_string()))?;
        let mut txn = self.doc.transact_mut_with(REMOTE_ORIGIN);
        txn.apply_update(update)
            .map_err(|e| ReplicaError::Apply(format!("{e:?}")))?;
        Ok(())
    }

    /// Encoded state vector, the first step of a sync handshake.
    pub fn state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Everything this replica has that the holder of `remote_sv` lacks.
    pub fn encode_diff(&self, remote_sv: &[u8]) -> Result<Vec<u8>, ReplicaError> {
        let sv = StateVector::decode_v1(remote_sv).map_err(|e| ReplicaError::Decode(e.to_string()))?;
        let txn = self.doc.transact();
        Ok(txn.encode_diff_v1(&sv))
    }

    /// Full document state as a single update.
    pub fn encode_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Subscribe to updates produced by local transactions.
    pub fn update_feed(&self) -> Result<UpdateFeed, ReplicaError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = self
            .doc
            .observe_update_v1(move |txn, event| {
                if DeliveryOrigin::of(txn) == DeliveryOrigin::Remote {
                    return;
                }
                let _ = tx.send(event.update.clone());
            })
            .map_err(|e| ReplicaError::Busy(format!("{e:?}")))?;
        Ok(UpdateFeed {
            rx,
            _subscription: subscription,
        })
    }
}

/// Locally produced engine updates, ready to ship to other replicas.
pub struct UpdateFeed {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    _subscription: Subscription,
}

impl UpdateFeed {
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Vec<u8>> {
        self.rx.try_recv().ok()
    }

    /// Take every update queued so far.
    pub fn drain(&mut self) -> Vec<Vec<u8>> {
        let mut updates = Vec::new();
        while let Ok(update) = self.rx.try_recv() {
            updates.push(update);
        }
        updates
    }
}

pub(crate) fn read_bool<T: ReadTxn>(map: &MapRef, txn: &T, key: &str) -> Option<bool> {
    match map.get(txn, key)? {
        Out::Any(Any::Bool(b)) => Some(b),
        _ => None,
    }
}

pub(crate) fn read_string<T: ReadTxn>(map: &MapRef, txn: &T, key: &str) -> Option<String> {
    match map.get(txn, key)? {
        Out::Any(Any::String(s)) => Some(s.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TODO_ITEM_SCHEMA;
    use yrs::GetString;

    #[test]
    fn test_create_model_writes_defaults() {
        let replica = Replica::new();
        let id = ObjectId::todo_item("1").unwrap();
        let map = {
            let mut txn = replica.write();
            replica.create_model(&mut txn, &id, &TODO_ITEM_SCHEMA)
        };

        let txn = replica.read();
        assert_eq!(read_string(&map, &txn, TYPE_FIELD).as_deref(), Some("TodoItem"));
        assert_eq!(read_string(&map, &txn, "textID").as_deref(), Some(""));
        assert_eq!(read_bool(&map, &txn, "complete"), Some(false));
    }

    #[test]
    fn test_get_by_identifier() {
        let replica = Replica::new();
        let item = ObjectId::todo_item("1").unwrap();
        let text = ObjectId::text("1").unwrap();
        {
            let mut txn = replica.write();
            replica.create_model(&mut txn, &item, &TODO_ITEM_SCHEMA);
            replica.create_text(&mut txn, &text, "hello");
        }

        let txn = replica.read();
        assert!(matches!(replica.get(&txn, &item), Some(ObjectRef::Model(_))));
        match replica.get(&txn, &text) {
            Some(ObjectRef::Text(t)) => assert_eq!(t.get_string(&txn), "hello"),
            other => panic!("expected text, got {other:?}"),
        }
        assert!(replica.get(&txn, &ObjectId::text("missing").unwrap()).is_none());
        drop(txn);
        assert_eq!(replica.object_count(), 2);
    }

    #[test]
    fn test_state_exchange_converges() {
        let a = Replica::new();
        let b = Replica::new();
        {
            let mut txn = a.write();
            a.create_text(&mut txn, &ObjectId::text("x").unwrap(), "from a");
        }

        let diff = a.encode_diff(&b.state_vector()).unwrap();
        b.apply_remote_update(&diff).unwrap();

        let txn = b.read();
        assert!(b.get(&txn, &ObjectId::text("x").unwrap()).is_some());
    }

    #[test]
    fn test_update_feed_skips_remote_updates() {
        let a = Replica::new();
        let b = Replica::new();
        let mut feed_a = a.update_feed().unwrap();
        let mut feed_b = b.update_feed().unwrap();

        {
            let mut txn = a.write();
            a.create_text(&mut txn, &ObjectId::text("x").unwrap(), "hi");
        }
        let updates = feed_a.drain();
        assert_eq!(updates.len(), 1);

        b.apply_remote_update(&updates[0]).unwrap();
        assert!(feed_b.try_recv().is_none(), "remote updates must not be echoed");
    }

    #[test]
    fn test_malformed_update_rejected() {
        let replica = Replica::new();
        assert!(matches!(
            replica.apply_remote_update(&[0xFF, 0xFE, 0xFD]),
            Err(ReplicaError::Decode(_)) | Err(ReplicaError::Apply(_))
        ));
        assert!(replica.encode_diff(&[0xFF, 0xFF, 0xFF]).is_err());
    }

    #[test]
    fn test_delivery_origin_tagging() {
        let replica = Replica::new();
        let map = replica.doc().get_or_insert_map("scratch");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = yrs::Observable::observe(&map, move |txn, _| {
            let _ = tx.send(DeliveryOrigin::of(txn));
        });

        {
            let mut txn = replica.write();
            map.insert(&mut txn, "k", true);
        }
        assert_eq!(rx.try_recv().unwrap(), DeliveryOrigin::Local);

        let other = Replica::from_doc(Doc::new());
        {
            let scratch = other.doc().get_or_insert_map("scratch");
            let mut txn = other.write();
            scratch.insert(&mut txn, "k2", false);
        }
        replica.apply_remote_update(&other.encode_state()).unwrap();
        assert_eq!(rx.try_recv().unwrap(), DeliveryOrigin::Remote);
    }
}
