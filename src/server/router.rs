//! Message routing
//!
//! The router turns one decoded message from one connection into registry
//! updates, stored files and outgoing messages. It never touches sockets;
//! everything leaves through an [`Outbox`] supplied by the caller.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::ChatError;
use crate::protocol::message::{Destination, Message, MessageKind};
use crate::server::groups::GroupRegistry;
use crate::server::registry::ClientRegistry;
use crate::store::FileStore;
use crate::transport::connection::ConnectionId;

/// Sink for messages produced while routing
pub trait Outbox {
    /// Whether `id` refers to a connection that still accepts messages
    fn is_open(&self, id: ConnectionId) -> bool;

    /// Queue `message` for `id`; false if it could not be queued
    fn deliver(&mut self, id: ConnectionId, message: &Message) -> bool;
}

/// What the caller should do with the originating connection afterwards
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Keep serving it
    Continue,
    /// Login accepted; the connection now speaks for this name
    Authenticated(String),
    /// Login rejected; write the queued reply, then close
    CloseAfterFlush,
    /// Logout; tear it down now
    Teardown,
}

/// Stateless dispatcher over the shared registries
#[derive(Clone)]
pub struct Router {
    clients: Arc<ClientRegistry>,
    groups: Arc<GroupRegistry>,
    store: Arc<dyn FileStore>,
}

impl Router {
    pub fn new(
        clients: Arc<ClientRegistry>,
        groups: Arc<GroupRegistry>,
        store: Arc<dyn FileStore>,
    ) -> Self {
        Self {
            clients,
            groups,
            store,
        }
    }

    pub fn clients(&self) -> &Arc<ClientRegistry> {
        &self.clients
    }

    pub fn groups(&self) -> &Arc<GroupRegistry> {
        &self.groups
    }

    /// Route one message received on `origin`.
    ///
    /// `bound` is the name `origin` logged in as, if it has. Messages other
    /// than `Login` from an unauthenticated connection are dropped.
    pub fn route(
        &self,
        origin: ConnectionId,
        bound: Option<&str>,
        message: Message,
        outbox: &mut dyn Outbox,
    ) -> Disposition {
        let Some(sender) = bound else {
            if message.kind == MessageKind::Login {
                return self.login(origin, &message, outbox);
            }
            debug!("Dropping {:?} before login on {}", message.kind, origin);
            return Disposition::Continue;
        };

        match message.kind {
            MessageKind::Login => {
                let err = ChatError::auth(format!("Already logged in as {}", sender));
                reject(outbox, origin, err);
                Disposition::Continue
            }
            MessageKind::Logout => {
                info!("{} logged out", sender);
                Disposition::Teardown
            }
            MessageKind::DirectMessage => {
                self.direct_message(origin, sender, message, outbox);
                Disposition::Continue
            }
            MessageKind::GroupMessage => {
                self.group_message(origin, sender, message, outbox);
                Disposition::Continue
            }
            MessageKind::FileTransfer => {
                self.file_transfer(origin, sender, message, outbox);
                Disposition::Continue
            }
            MessageKind::CreateGroup => {
                self.create_group(origin, &message, outbox);
                Disposition::Continue
            }
            MessageKind::JoinGroup => {
                self.join_group(origin, sender, &message, outbox);
                Disposition::Continue
            }
            MessageKind::Status | MessageKind::Success | MessageKind::Error => {
                debug!("Ignoring {:?} from {}", message.kind, sender);
                Disposition::Continue
            }
        }
    }

    /// Release everything held by `name`: its binding and its memberships
    pub fn disconnect(&self, name: &str) {
        self.clients.unbind(name);
        let left = self.groups.remove_member_everywhere(name);
        if !left.is_empty() {
            debug!("{} removed from groups {:?}", name, left);
        }
    }

    fn login(
        &self,
        origin: ConnectionId,
        message: &Message,
        outbox: &mut dyn Outbox,
    ) -> Disposition {
        let name = message.sender.as_str();
        if self.clients.bind(name, origin) {
            info!("{} logged in on {}", name, origin);
            outbox.deliver(origin, &Message::success(format!("Logged in as {}", name)));
            Disposition::Authenticated(name.to_string())
        } else {
            warn!("Rejected login {:?} on {}", name, origin);
            let err = ChatError::auth(format!("Name already in use or invalid: {}", name));
            reject(outbox, origin, err);
            Disposition::CloseAfterFlush
        }
    }

    fn direct_message(
        &self,
        origin: ConnectionId,
        sender: &str,
        mut message: Message,
        outbox: &mut dyn Outbox,
    ) {
        let recipient = match message.destination() {
            Some(Destination::User(recipient)) => recipient.to_string(),
            _ => {
                let err = ChatError::invalid_message("Direct message needs exactly one recipient");
                reject(outbox, origin, err);
                return;
            }
        };

        if recipient == sender {
            let err = ChatError::invalid_message("Cannot send a direct message to yourself");
            reject(outbox, origin, err);
            return;
        }

        let Some(target) = self.online(&recipient, outbox) else {
            reject(outbox, origin, ChatError::user_not_found(recipient));
            return;
        };

        message.sender = sender.to_string();
        if !outbox.deliver(target, &message) {
            let err = ChatError::connection(format!("Could not deliver to {}", recipient));
            reject(outbox, origin, err);
            return;
        }
        let ack = Message::success(format!("Message sent to {}", recipient));
        outbox.deliver(origin, &ack);
    }

    fn group_message(
        &self,
        origin: ConnectionId,
        sender: &str,
        mut message: Message,
        outbox: &mut dyn Outbox,
    ) {
        let group_name = match message.destination() {
            Some(Destination::Group(group)) => group.to_string(),
            _ => {
                let err = ChatError::invalid_message("Group message needs exactly one group");
                reject(outbox, origin, err);
                return;
            }
        };

        let targets = match self.group_targets(&group_name, sender, outbox) {
            Ok(targets) => targets,
            Err(err) => {
                reject(outbox, origin, err);
                return;
            }
        };

        message.sender = sender.to_string();
        for target in targets {
            outbox.deliver(target, &message);
        }
        let ack = Message::success(format!("Message sent to group {}", group_name));
        outbox.deliver(origin, &ack);
    }

    fn file_transfer(
        &self,
        origin: ConnectionId,
        sender: &str,
        mut message: Message,
        outbox: &mut dyn Outbox,
    ) {
        let Some(file_name) = message.file_name.clone() else {
            let err = ChatError::invalid_message("File transfer has no file name");
            reject(outbox, origin, err);
            return;
        };

        let resolved = match message.destination() {
            Some(Destination::User(recipient)) if recipient == sender => {
                Err(ChatError::invalid_message("Cannot send a file to yourself"))
            }
            Some(Destination::User(recipient)) => self
                .online(recipient, outbox)
                .map(|target| vec![target])
                .ok_or_else(|| ChatError::user_not_found(recipient)),
            Some(Destination::Group(group)) => self.group_targets(group, sender, outbox),
            None => {
                let reason = "File transfer needs a recipient or a group";
                Err(ChatError::invalid_message(reason))
            }
        };
        let targets = match resolved {
            Ok(targets) => targets,
            Err(err) => {
                reject(outbox, origin, err);
                return;
            }
        };

        let bytes = message.file_bytes.as_deref().unwrap_or_default();
        match self.store.store(sender, &file_name, bytes) {
            Ok(path) => debug!("Stored {} ({} bytes)", path.display(), bytes.len()),
            Err(e) => {
                warn!("Failed to store {} from {}: {}", file_name, sender, e);
                let err = ChatError::storage(format!("Failed to store {}: {}", file_name, e));
                reject(outbox, origin, err);
                return;
            }
        }

        message.sender = sender.to_string();
        let to_user = message.recipient.is_some();
        for target in targets {
            if !outbox.deliver(target, &message) && to_user {
                let err = ChatError::connection(format!("Could not deliver {}", file_name));
                reject(outbox, origin, err);
                return;
            }
        }
        let ack = Message::success(format!("File sent: {}", file_name));
        outbox.deliver(origin, &ack);
    }

    fn create_group(&self, origin: ConnectionId, message: &Message, outbox: &mut dyn Outbox) {
        let group_name = message.group_name.as_deref().unwrap_or_default();
        let reply = if self.groups.create_group(group_name) {
            info!("Group {} created by {}", group_name, message.sender);
            Message::success(format!("Group created: {}", group_name))
        } else {
            Message::error(format!("Group exists or invalid name: {}", group_name))
        };
        outbox.deliver(origin, &reply);
    }

    fn join_group(
        &self,
        origin: ConnectionId,
        sender: &str,
        message: &Message,
        outbox: &mut dyn Outbox,
    ) {
        let group_name = message.group_name.as_deref().unwrap_or_default();
        // Unknown group and existing membership share one reply
        let reply = if self.groups.join_group(group_name, sender) {
            debug!("{} joined {}", sender, group_name);
            Message::success(format!("Joined group: {}", group_name))
        } else {
            Message::error(format!("Could not join group: {}", group_name))
        };
        outbox.deliver(origin, &reply);
    }

    /// Connection serving `name`, if it is bound and still open
    fn online(&self, name: &str, outbox: &dyn Outbox) -> Option<ConnectionId> {
        self.clients.lookup(name).filter(|id| outbox.is_open(*id))
    }

    /// Open connections of every other member of `group_name`.
    ///
    /// Fails if the group does not exist or `sender` is not in it.
    fn group_targets(
        &self,
        group_name: &str,
        sender: &str,
        outbox: &dyn Outbox,
    ) -> Result<Vec<ConnectionId>, ChatError> {
        if !self.groups.exists(group_name) {
            return Err(ChatError::group_not_found(group_name));
        }
        if !self.groups.is_member(group_name, sender) {
            let err = ChatError::auth(format!("Not a member of group {}", group_name));
            return Err(err);
        }
        let targets = self
            .groups
            .members_of(group_name)
            .iter()
            .filter(|member| member.as_str() != sender)
            .filter_map(|member| self.online(member, outbox))
            .collect();
        Ok(targets)
    }
}

/// Send `err` back to `origin` as an Error reply
fn reject(outbox: &mut dyn Outbox, origin: ConnectionId, err: ChatError) {
    debug!("Rejecting request from {}: {}", origin, err);
    outbox.deliver(origin, &Message::from(err));
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("clients", &self.clients.len())
            .field("groups", &self.groups.group_count())
            .finish_non_exhaustive()
    }
}
