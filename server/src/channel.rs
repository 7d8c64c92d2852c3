//! Conversation channel
//!
//! One channel per WebSocket connection: an authenticated user talking to
//! one named peer. The channel walks
//! `Connecting -> Authenticated -> Subscribed -> Closed`:
//!
//! - [`authenticate`] verifies the bearer credential and resolves both
//!   users (Connecting -> Authenticated).
//! - [`ChatChannel::subscribe`] joins the owner's inbox group
//!   (Authenticated -> Subscribed). The transport accepts the upgrade only
//!   after this point.
//! - [`ChatChannel::handle_text`] persists each chat frame and then
//!   publishes it to the peer's inbox.
//! - [`ChatChannel::close`] (or dropping the channel) leaves the group.
//!
//! Every connection of a user subscribes to `private_<username>`, so a
//! message published there reaches all of that user's devices and never
//! the sender's own connections.
//!
//! Note the direction: a channel listens on its *own* inbox and publishes to
//! the peer's. Subscribing to `private_<peer>` instead would hand every
//! message back to the sender and never reach the peer's devices.

use std::sync::Arc;

use lms_chat_shared::{inbox_address, parse_inbound, GroupEvent, ProtocolError};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::auth::TokenAuthenticator;
use crate::db::{Message, MessageStore, User, UserDirectory};
use crate::error::{ChatError, HandshakeError};
use crate::fabric::{GroupFabric, Subscription};

/// Lifecycle of a conversation channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Authenticated,
    Subscribed,
    Closed,
}

/// Services shared by every channel
#[derive(Clone)]
pub struct ChatServices {
    pub authenticator: Arc<TokenAuthenticator>,
    pub directory: Arc<dyn UserDirectory>,
    pub store: Arc<dyn MessageStore>,
    pub fabric: Arc<dyn GroupFabric>,
    /// Delivery queue capacity per channel
    pub outbound_buffer: usize,
    /// Also publish each message to the sender's own inbox
    pub echo_to_sender: bool,
}

/// Both parties of a conversation, resolved during the handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participants {
    /// The authenticated caller
    pub subject: User,
    /// The counterpart named by the `username` query parameter
    pub peer: User,
}

/// Result of handling one inbound frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Not a chat frame; nothing stored or published
    Ignored,
    /// Stored, then published to the peer's inbox
    Sent { message: Message, delivered: usize },
}

/// Handshake: verify the credential and resolve both users.
///
/// Both lookups finish before this returns, so the upgrade is never
/// accepted for a caller or peer the directory does not know.
pub async fn authenticate(
    services: &ChatServices,
    username: Option<&str>,
    authorization: Option<&str>,
) -> Result<Participants, HandshakeError> {
    let username = username
        .filter(|u| !u.is_empty())
        .ok_or(HandshakeError::MissingUsername)?;
    let subject_id = services.authenticator.authenticate(authorization)?;

    let (subject, peer) = tokio::join!(
        services.directory.get_by_id(subject_id),
        services.directory.get_by_username(username),
    );

    let subject = subject
        .map_err(HandshakeError::Directory)?
        .ok_or(HandshakeError::UnknownSubject(subject_id))?;
    let peer = peer
        .map_err(HandshakeError::Directory)?
        .ok_or_else(|| HandshakeError::UnknownPeer(username.to_string()))?;

    Ok(Participants { subject, peer })
}

/// An active conversation channel
pub struct ChatChannel {
    services: ChatServices,
    subject: User,
    peer: User,
    peer_inbox: String,
    inbox: Option<Subscription>,
    state: ChannelState,
}

impl ChatChannel {
    /// Join the owner's inbox group.
    ///
    /// Returns the channel and the receiving half of its delivery queue;
    /// the transport forwards everything received there to the socket.
    pub fn subscribe(
        services: ChatServices,
        participants: Participants,
    ) -> (Self, mpsc::Receiver<GroupEvent>) {
        let Participants { subject, peer } = participants;
        let (tx, rx) = mpsc::channel(services.outbound_buffer);

        let inbox = Subscription::open(
            services.fabric.clone(),
            inbox_address(&subject.username),
            tx,
        );
        let peer_inbox = inbox_address(&peer.username);

        debug!(
            "{} subscribed to {} (talking to {})",
            subject.username,
            inbox.group(),
            peer.username
        );

        let channel = Self {
            services,
            subject,
            peer,
            peer_inbox,
            inbox: Some(inbox),
            state: ChannelState::Subscribed,
        };
        (channel, rx)
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn subject(&self) -> &User {
        &self.subject
    }

    pub fn peer(&self) -> &User {
        &self.peer
    }

    /// Group this channel receives deliveries on, while subscribed
    pub fn inbox_address(&self) -> Option<&str> {
        self.inbox.as_ref().map(|s| s.group())
    }

    /// Group this channel publishes to
    pub fn peer_address(&self) -> &str {
        &self.peer_inbox
    }

    /// Handle one inbound text frame.
    ///
    /// Frames without chat text are ignored. Otherwise the message is
    /// appended to the store first; only a successful append is published.
    /// Errors abort this frame only.
    pub async fn handle_text(&mut self, text: &str) -> Result<FrameOutcome, ChatError> {
        if self.state != ChannelState::Subscribed {
            debug!("Frame on {:?} channel ignored", self.state);
            return Ok(FrameOutcome::Ignored);
        }

        let frame = match parse_inbound(text) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("Ignoring frame from {}: {}", self.subject.username, e);
                return Ok(FrameOutcome::Ignored);
            }
        };
        let Some(content) = frame.chat_text() else {
            return Ok(FrameOutcome::Ignored);
        };

        let message = self
            .services
            .store
            .append(self.subject.id, self.peer.id, content)
            .await
            .map_err(ChatError::Storage)?;

        let event = GroupEvent::chat_message(content, &self.subject.username);
        let delivered = self.publish(&self.peer_inbox, event.clone()).await?;

        if self.services.echo_to_sender && self.subject.id != self.peer.id {
            if let Some(own) = self.inbox_address() {
                self.publish(own, event).await?;
            }
        }

        Ok(FrameOutcome::Sent { message, delivered })
    }

    async fn publish(&self, group: &str, event: GroupEvent) -> Result<usize, ChatError> {
        self.services
            .fabric
            .publish(group, event)
            .await
            .map_err(|reason| ChatError::Publish {
                group: group.to_string(),
                reason,
            })
    }

    /// Leave the inbox group. Safe to call more than once.
    pub fn close(&mut self) {
        if self.state == ChannelState::Closed {
            return;
        }
        if let Some(inbox) = self.inbox.take() {
            info!("{} left {}", self.subject.username, inbox.group());
        }
        self.state = ChannelState::Closed;
    }
}

/// Render a delivered event as the client's text frame
pub fn render_delivery(event: &GroupEvent) -> Result<String, ProtocolError> {
    event.to_outbound().to_json()
}
