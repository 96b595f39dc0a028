//! Replicated object adapter: schemas and typed wrappers over engine handles.
//!
//! A wrapper never owns data. It holds the Yrs handle of an object living in
//! the [`Replica`] and reads or writes through the caller's transaction.

use std::collections::HashSet;

use yrs::{
    Any, Array, ArrayRef, GetString, Map, MapRef, Observable, Out, ReadTxn, Subscription, Text,
    TextRef, TransactionMut,
};

use crate::ids::{IdError, ObjectId, TEXT_TYPE, TODO_ITEM_TYPE, TODO_LIST_TYPE};
use crate::replica::{
    read_bool, read_string, DeliveryOrigin, DeliverySender, ObjectRef, Replica, TYPE_FIELD,
};

pub const TEXT_ID_FIELD: &str = "textID";
pub const COMPLETE_FIELD: &str = "complete";

/// Default value of a schema field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldValue {
    Bool(bool),
    Str(&'static str),
}

#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub name: &'static str,
    pub default: FieldValue,
}

/// Declared type of a schema object: its name and default-valued fields.
#[derive(Debug, Clone, Copy)]
pub struct Schema {
    pub type_name: &'static str,
    pub fields: &'static [FieldSpec],
}

pub const TODO_ITEM_SCHEMA: Schema = Schema {
    type_name: TODO_ITEM_TYPE,
    fields: &[
        FieldSpec {
            name: TEXT_ID_FIELD,
            default: FieldValue::Str(""),
        },
        FieldSpec {
            name: COMPLETE_FIELD,
            default: FieldValue::Bool(false),
        },
    ],
};

/// Partial field update for a TodoItem. `None` leaves the field untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ItemUpdate {
    pub complete: Option<bool>,
}

impl ItemUpdate {
    pub fn complete(value: bool) -> Self {
        Self {
            complete: Some(value),
        }
    }
}

fn watch_with<O>(target: &O, sink: DeliverySender) -> Subscription
where
    O: Observable,
    yrs::types::Event: AsRef<O::Event>,
{
    target.observe(move |txn, _| {
        let _ = sink.send(DeliveryOrigin::of(txn));
    })
}

/// One to-do entry: `{ textID, complete }`.
#[derive(Debug, Clone)]
pub struct TodoItem {
    id: ObjectId,
    map: MapRef,
}

impl TodoItem {
    /// Create an item pointing at `text_id`, incomplete.
    pub fn create(
        txn: &mut TransactionMut,
        replica: &Replica,
        id: ObjectId,
        text_id: &ObjectId,
    ) -> Self {
        let map = replica.create_model(txn, &id, &TODO_ITEM_SCHEMA);
        map.insert(txn, TEXT_ID_FIELD, text_id.to_string());
        Self { id, map }
    }

    /// Look up an existing item. Objects of any other type yield `None`.
    pub fn get<T: ReadTxn>(txn: &T, replica: &Replica, id: &ObjectId) -> Option<Self> {
        if !id.is_type(TODO_ITEM_TYPE) {
            return None;
        }
        match replica.get(txn, id)? {
            ObjectRef::Model(map)
                if read_string(&map, txn, TYPE_FIELD).as_deref() == Some(TODO_ITEM_TYPE) =>
            {
                Some(Self {
                    id: id.clone(),
                    map,
                })
            }
            _ => None,
        }
    }

    pub fn id(&self) -> &ObjectId {
        &self.id
    }

    pub fn complete<T: ReadTxn>(&self, txn: &T) -> bool {
        read_bool(&self.map, txn, COMPLETE_FIELD).unwrap_or(false)
    }

    /// The stored Text reference, if it parses.
    pub fn text_id<T: ReadTxn>(&self, txn: &T) -> Option<ObjectId> {
        let raw = read_string(&self.map, txn, TEXT_ID_FIELD)?;
        ObjectId::parse(&raw).ok()
    }

    /// Apply a partial update. Returns whether any field changed.
    pub fn apply(&self, txn: &mut TransactionMut, update: &ItemUpdate) -> bool {
        let mut changed = false;
        if let Some(complete) = update.complete {
            if read_bool(&self.map, txn, COMPLETE_FIELD) != Some(complete) {
                self.map.insert(txn, COMPLETE_FIELD, complete);
                changed = true;
            }
        }
        changed
    }

    pub fn watch(&self, sink: DeliverySender) -> Subscription {
        watch_with(&self.map, sink)
    }
}

/// A mergeable string object.
#[derive(Debug, Clone)]
pub struct TextObject {
    id: ObjectId,
    text: TextRef,
}

impl TextObject {
    pub fn create(txn: &mut TransactionMut, replica: &Replica, id: ObjectId, value: &str) -> Self {
        let text = replica.create_text(txn, &id, value);
        Self { id, text }
    }

    pub fn get<T: ReadTxn>(txn: &T, replica: &Replica, id: &ObjectId) -> Option<Self> {
        if !id.is_type(TEXT_TYPE) {
            return None;
        }
        match replica.get(txn, id)? {
            ObjectRef::Text(text) => Some(Self {
                id: id.clone(),
                text,
            }),
            ObjectRef::Model(_) => None,
        }
    }

    pub fn id(&self) -> &ObjectId {
        &self.id
    }

    pub fn value<T: ReadTxn>(&self, txn: &T) -> String {
        self.text.get_string(txn)
    }

    /// Replace the whole content. Returns whether the value changed.
    pub fn set(&self, txn: &mut TransactionMut, value: &str) -> bool {
        if self.text.get_string(txn) == value {
            return false;
        }
        let len = self.text.len(txn);
        if len > 0 {
            self.text.remove_range(txn, 0, len);
        }
        self.text.insert(txn, 0, value);
        true
    }

    pub fn watch(&self, sink: DeliverySender) -> Subscription {
        watch_with(&self.text, sink)
    }
}

/// Ordered collection of member identifiers.
///
/// Enumeration keeps the first occurrence of each identifier, so concurrent
/// adds of the same member from two replicas never show twice.
#[derive(Debug, Clone)]
pub struct TodoList {
    id: ObjectId,
    members: ArrayRef,
}

impl TodoList {
    /// Open (or lazily create) the list named by `id`.
    pub fn open(replica: &Replica, id: ObjectId) -> Result<Self, IdError> {
        let id = id.require_type(TODO_LIST_TYPE)?;
        let members = replica.doc().get_or_insert_array(id.as_str());
        Ok(Self { id, members })
    }

    pub fn id(&self) -> &ObjectId {
        &self.id
    }

    /// Append `member` unless already present. Returns whether it was added.
    pub fn add_member(&self, txn: &mut TransactionMut, member: &ObjectId) -> bool {
        if self.contains(txn, member) {
            return false;
        }
        self.members.push_back(txn, member.to_string());
        true
    }

    /// Remove every occurrence of `member`. Returns how many were removed.
    pub fn remove_member(&self, txn: &mut TransactionMut, member: &ObjectId) -> usize {
        let positions: Vec<u32> = self
            .members
            .iter(txn)
            .enumerate()
            .filter(|(_, value)| is_member(value, member))
            .map(|(index, _)| index as u32)
            .collect();
        for index in positions.iter().rev() {
            self.members.remove(txn, *index);
        }
        positions.len()
    }

    /// Members in insertion order, deduplicated. Malformed entries are skipped.
    pub fn members<T: ReadTxn>(&self, txn: &T) -> Vec<ObjectId> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for value in self.members.iter(txn) {
            let Out::Any(Any::String(raw)) = value else {
                continue;
            };
            match ObjectId::parse(&raw) {
                Ok(id) => {
                    if seen.insert(id.clone()) {
                        out.push(id);
                    }
                }
                Err(e) => log::warn!("skipping malformed list entry in {}: {e}", self.id),
            }
        }
        out
    }

    pub fn contains<T: ReadTxn>(&self, txn: &T, member: &ObjectId) -> bool {
        self.members.iter(txn).any(|value| is_member(&value, member))
    }

    /// Number of distinct members.
    pub fn len<T: ReadTxn>(&self, txn: &T) -> usize {
        self.members(txn).len()
    }

    pub fn is_empty<T: ReadTxn>(&self, txn: &T) -> bool {
        self.members.len(txn) == 0
    }

    pub fn watch(&self, sink: DeliverySender) -> Subscription {
        watch_with(&self.members, sink)
    }
}

fn is_member(value: &Out, member: &ObjectId) -> bool {
    matches!(value, Out::Any(Any::String(raw)) if &**raw == member.as_str())
}
