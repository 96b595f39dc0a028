//! Replica store: the to-do collection as seen by one client.
//!
//! Mutations go straight into the replica and never notify on their own.
//! Engine observers (local or remote origin alike) queue a delivery, and
//! [`TodoStore::flush_deliveries`] turns queued deliveries into one change
//! event after refreshing which objects are watched.
//!
//! ```text
//!  command ──► TodoStore::{create,update,..} ──► yrs txn
//!                                                  │ observers
//!  remote update ──► Replica::apply_remote_update ─┤
//!                                                  ▼
//!                                          delivery queue
//!                                                  │ flush_deliveries
//!                                                  ▼
//!                          ensure_subscribed ─► ChangeNotifier::emit
//! ```

use std::collections::{HashMap, HashSet};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use yrs::{ReadTxn, Subscription};

use crate::command::{Command, CommandOutcome};
use crate::dispatcher::CommandHandler;
use crate::ids::{fresh_token, IdError, ObjectId, DEFAULT_LIST_TOKEN, TODO_ITEM_TYPE};
use crate::model::{ItemUpdate, TextObject, TodoItem, TodoList};
use crate::notifier::{ChangeEvent, ChangeNotifier, Listener};
use crate::replica::{DeliveryOrigin, DeliverySender, Replica, ReplicaError};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("invalid identifier: {0}")]
    InvalidId(#[from] IdError),
    #[error("replica error: {0}")]
    Replica(#[from] ReplicaError),
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Token of the list this store manages.
    pub list_token: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            list_token: DEFAULT_LIST_TOKEN.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreState {
    Quiescent,
    Notifying,
}

/// Read-model entry handed to views.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TodoView {
    /// Raw id token, without the `/TodoItem#` prefix.
    pub id: String,
    pub text: String,
    pub complete: bool,
}

enum Watched {
    Item(TodoItem),
    Text(TextObject),
}

pub struct TodoStore {
    replica: Replica,
    list: TodoList,
    notifier: ChangeNotifier,
    watched: HashMap<ObjectId, Subscription>,
    _list_subscription: Subscription,
    delivery_tx: DeliverySender,
    delivery_rx: mpsc::UnboundedReceiver<DeliveryOrigin>,
    state: StoreState,
}

impl TodoStore {
    /// Build a store over an already opened list.
    pub fn new(replica: Replica, list: TodoList) -> Self {
        let (delivery_tx, delivery_rx) = mpsc::unbounded_channel();
        let list_subscription = list.watch(delivery_tx.clone());
        let mut store = Self {
            replica,
            list,
            notifier: ChangeNotifier::new(),
            watched: HashMap::new(),
            _list_subscription: list_subscription,
            delivery_tx,
            delivery_rx,
            state: StoreState::Quiescent,
        };
        store.ensure_subscribed();
        store
    }

    pub fn open(replica: Replica, config: &StoreConfig) -> Result<Self, StoreError> {
        let list = TodoList::open(&replica, ObjectId::todo_list(&config.list_token)?)?;
        Ok(Self::new(replica, list))
    }

    pub fn replica(&self) -> &Replica {
        &self.replica
    }

    pub fn list(&self) -> &TodoList {
        &self.list
    }

    pub fn state(&self) -> StoreState {
        self.state
    }

    /// Number of objects currently watched (items plus their texts).
    pub fn watched_count(&self) -> usize {
        self.watched.len()
    }

    /// Create a new item. Returns its id token, or `None` for blank text.
    pub fn create(&mut self, text: &str) -> Result<Option<String>, StoreError> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(None);
        }
        let token = fresh_token();
        let text_id = ObjectId::text(&token)?;
        let item_id = ObjectId::todo_item(&token)?;

        let mut txn = self.replica.write();
        TextObject::create(&mut txn, &self.replica, text_id.clone(), text);
        TodoItem::create(&mut txn, &self.replica, item_id.clone(), &text_id);
        self.list.add_member(&mut txn, &item_id);
        log::debug!("created {item_id}");
        Ok(Some(token))
    }

    /// Apply `update` to a listed item. Unknown ids are a no-op.
    pub fn update(&mut self, id: &str, update: &ItemUpdate) -> Result<bool, StoreError> {
        let item_id = item_id(id)?;
        let mut txn = self.replica.write();
        if !self.list.contains(&txn, &item_id) {
            return Ok(false);
        }
        let Some(item) = TodoItem::get(&txn, &self.replica, &item_id) else {
            return Ok(false);
        };
        Ok(item.apply(&mut txn, update))
    }

    /// Replace an item's text, found through the item's `textID` reference.
    pub fn update_text(&mut self, id: &str, text: &str) -> Result<bool, StoreError> {
        let item_id = item_id(id)?;
        let text = text.trim();
        if text.is_empty() {
            return Ok(false);
        }
        let mut txn = self.replica.write();
        if !self.list.contains(&txn, &item_id) {
            return Ok(false);
        }
        let Some(item) = TodoItem::get(&txn, &self.replica, &item_id) else {
            return Ok(false);
        };
        let text_object = item
            .text_id(&txn)
            .and_then(|text_id| TextObject::get(&txn, &self.replica, &text_id));
        match text_object {
            Some(text_object) => Ok(text_object.set(&mut txn, text)),
            None => {
                log::warn!("{item_id} has a dangling text reference, update ignored");
                Ok(false)
            }
        }
    }

    /// Apply `update` to every visible item in one transaction. Returns how
    /// many changed.
    pub fn update_all(&mut self, update: &ItemUpdate) -> usize {
        let mut txn = self.replica.write();
        let mut changed = 0;
        for (item, _) in self.visible(&txn) {
            if item.apply(&mut txn, update) {
                changed += 1;
            }
        }
        changed
    }

    /// Remove an item from the list. The objects stay in the replica.
    pub fn destroy(&mut self, id: &str) -> Result<bool, StoreError> {
        let item_id = item_id(id)?;
        let mut txn = self.replica.write();
        Ok(self.list.remove_member(&mut txn, &item_id) > 0)
    }

    /// Remove every visible item that is complete right now. Returns how many.
    pub fn destroy_completed(&mut self) -> usize {
        let completed: Vec<ObjectId> = {
            let txn = self.replica.read();
            self.visible(&txn)
                .into_iter()
                .filter(|(item, _)| item.complete(&txn))
                .map(|(item, _)| item.id().clone())
                .collect()
        };
        if completed.is_empty() {
            return 0;
        }
        let mut txn = self.replica.write();
        for member in &completed {
            self.list.remove_member(&mut txn, member);
        }
        completed.len()
    }

    /// True when every visible item is complete, and for an empty list.
    pub fn are_all_complete(&self) -> bool {
        self.get_all().iter().all(|view| view.complete)
    }

    /// Fresh read-model snapshot, in list order.
    pub fn get_all(&self) -> Vec<TodoView> {
        let txn = self.replica.read();
        self.visible(&txn)
            .into_iter()
            .map(|(item, text)| TodoView {
                id: item.id().token().to_string(),
                text: text.value(&txn),
                complete: item.complete(&txn),
            })
            .collect()
    }

    /// Members that are live items with a resolvable text, in list order.
    ///
    /// Every bulk operation and the read model go through this, so an item
    /// hidden from views is never toggled or cleared either.
    fn visible<T: ReadTxn>(&self, txn: &T) -> Vec<(TodoItem, TextObject)> {
        let mut visible = Vec::new();
        for member in self.list.members(txn) {
            let Some(item) = TodoItem::get(txn, &self.replica, &member) else {
                log::warn!("list member {member} is not a live TodoItem");
                continue;
            };
            let text = item
                .text_id(txn)
                .and_then(|text_id| TextObject::get(txn, &self.replica, &text_id));
            let Some(text) = text else {
                log::warn!("{member} has a dangling text reference, hidden");
                continue;
            };
            visible.push((item, text));
        }
        visible
    }

    /// Refresh subscriptions and notify listeners.
    pub fn deliver(&mut self, origin: DeliveryOrigin) {
        self.state = StoreState::Notifying;
        self.ensure_subscribed();
        self.notifier.emit(&ChangeEvent { origin });
        self.state = StoreState::Quiescent;
    }

    /// Turn queued engine deliveries into a single change event.
    ///
    /// Returns the number of deliveries consumed.
    pub fn flush_deliveries(&mut self) -> usize {
        let mut count = 0;
        let mut origin = DeliveryOrigin::Local;
        while let Ok(o) = self.delivery_rx.try_recv() {
            count += 1;
            if o == DeliveryOrigin::Remote {
                origin = DeliveryOrigin::Remote;
            }
        }
        if count > 0 {
            log::trace!("flushing {count} deliveries ({origin:?})");
            self.deliver(origin);
        }
        count
    }

    pub fn add_change_listener(&mut self, listener: Listener) {
        self.notifier.subscribe(listener);
    }

    pub fn remove_change_listener(&mut self, listener: &Listener) -> bool {
        self.notifier.unsubscribe(listener)
    }

    /// Watch every current member and its text; drop watches on departed ones.
    fn ensure_subscribed(&mut self) {
        let wanted: Vec<(ObjectId, Watched)> = {
            let txn = self.replica.read();
            let mut wanted = Vec::new();
            for member in self.list.members(&txn) {
                let Some(item) = TodoItem::get(&txn, &self.replica, &member) else {
                    continue;
                };
                if let Some(text_id) = item.text_id(&txn) {
                    if let Some(text) = TextObject::get(&txn, &self.replica, &text_id) {
                        wanted.push((text_id, Watched::Text(text)));
                    }
                }
                wanted.push((member, Watched::Item(item)));
            }
            wanted
        };

        let keep: HashSet<&ObjectId> = wanted.iter().map(|(id, _)| id).collect();
        let before = self.watched.len();
        self.watched.retain(|id, _| keep.contains(id));
        let dropped = before - self.watched.len();

        let mut added = 0;
        for (id, target) in wanted {
            if self.watched.contains_key(&id) {
                continue;
            }
            let subscription = match &target {
                Watched::Item(item) => item.watch(self.delivery_tx.clone()),
                Watched::Text(text) => text.watch(self.delivery_tx.clone()),
            };
            self.watched.insert(id, subscription);
            added += 1;
        }
        if added > 0 || dropped > 0 {
            log::debug!("subscriptions: +{added} -{dropped} ({} watched)", self.watched.len());
        }
    }
}

fn item_id(id: &str) -> Result<ObjectId, IdError> {
    if id.starts_with('/') {
        ObjectId::parse(id)?.require_type(TODO_ITEM_TYPE)
    } else {
        ObjectId::todo_item(id)
    }
}

fn outcome(result: Result<bool, StoreError>) -> CommandOutcome {
    match result {
        Ok(true) => CommandOutcome::Applied,
        Ok(false) => CommandOutcome::NoOp,
        Err(e) => CommandOutcome::Rejected(e.to_string()),
    }
}

fn rejected_empty(kind: &str) -> CommandOutcome {
    log::debug!("{kind} ignored: text is empty");
    CommandOutcome::Rejected("text is empty".to_string())
}

impl CommandHandler for TodoStore {
    fn handle(&mut self, command: &Command) -> CommandOutcome {
        match command {
            Command::Create { text } => {
                if text.trim().is_empty() {
                    return rejected_empty(command.kind());
                }
                outcome(self.create(text).map(|token| token.is_some()))
            }
            Command::ToggleCompleteAll => {
                let complete = !self.are_all_complete();
                outcome(Ok(self.update_all(&ItemUpdate::complete(complete)) > 0))
            }
            Command::UndoComplete { id } => outcome(self.update(id, &ItemUpdate::complete(false))),
            Command::Complete { id } => outcome(self.update(id, &ItemUpdate::complete(true))),
            Command::UpdateText { id, text } => {
                if text.trim().is_empty() {
                    return rejected_empty(command.kind());
                }
                outcome(self.update_text(id, text))
            }
            Command::Destroy { id } => outcome(self.destroy(id)),
            Command::DestroyCompleted => outcome(Ok(self.destroy_completed() > 0)),
            Command::Unknown => CommandOutcome::NoOp,
        }
    }
}
