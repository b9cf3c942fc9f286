// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Components
//!
//! A [`BrokerComponent`] is the state shared by every named broker resource
//! (exchanges and queues): the connection it uses, the channel it works on
//! and its lifecycle.
//!
//! A component is created in one of two ways:
//! - *init*: it opens its own connection and channel and owns them;
//! - *dependent*: it borrows the already open channel of another component
//!   (a queue subscribing to an exchange) and never closes it.
//!
//! The lifecycle is driven by a background task:
//! `Created → Connecting → ChannelOpen → Ready`, ending in `Failed` when a
//! step fails, `Dead` when the broker closes the channel and `Closed` after
//! [`BrokerComponent::close`]. Readiness is observed through
//! [`BrokerComponent::ready`], which serves callers arriving before and after
//! the transition alike.
//!
//! When the broker closes a shared channel, the owner and every dependent
//! still working on it become `Dead`.

use crate::{
    channel::{BrokerChannel, BrokerConnection, BrokerEvent, Connector, EventSender},
    errors::AmqpError,
    settings::ConnectionSettings,
};
use async_trait::async_trait;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, MutexGuard, RwLock, Weak,
};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, error, info};

/// Lifecycle of a broker component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComponentState {
    Created,
    Connecting,
    ChannelOpen,
    Ready,
    Failed(AmqpError),
    Dead(String),
    Closed,
}

impl ComponentState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ComponentState::Failed(_) | ComponentState::Dead(_) | ComponentState::Closed
        )
    }
}

/// An open channel, shared by the component that opened it and every
/// component depending on it.
#[derive(Clone)]
pub(crate) struct SharedChannel {
    pub(crate) channel: Arc<dyn BrokerChannel>,
    pub(crate) events: EventSender,
    setup_lock: Arc<tokio::sync::Mutex<()>>,
    /// Reason the broker gave when it closed the channel.
    lost: watch::Receiver<Option<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Owner,
    Dependent,
}

#[derive(Default)]
struct Link {
    connection: Option<Arc<dyn BrokerConnection>>,
    shared: Option<SharedChannel>,
}

/// Connection, channel and lifecycle of a named broker resource.
pub struct BrokerComponent {
    name: RwLock<String>,
    durable: bool,
    settings: ConnectionSettings,
    connector: Option<Arc<dyn Connector>>,
    role: Role,
    link: Mutex<Link>,
    open: AtomicBool,
    state: watch::Sender<ComponentState>,
    lost: watch::Sender<Option<String>>,
}

impl BrokerComponent {
    /// A component that will open its own connection through `connector`.
    pub(crate) fn init(
        connector: Arc<dyn Connector>,
        settings: &ConnectionSettings,
        name: &str,
        durable: bool,
    ) -> BrokerComponent {
        BrokerComponent {
            name: RwLock::new(name.to_owned()),
            durable,
            settings: settings.clone(),
            connector: Some(connector),
            role: Role::Owner,
            link: Mutex::new(Link::default()),
            open: AtomicBool::new(false),
            state: watch::Sender::new(ComponentState::Created),
            lost: watch::Sender::new(None),
        }
    }

    /// A component working on the channel of `parent`.
    ///
    /// # Errors
    /// Returns `ChannelNotReady` when `parent` has no open channel: a
    /// dependent cannot be built on a component that is not set up.
    pub(crate) fn dependent_of(
        parent: &BrokerComponent,
        name: &str,
        durable: bool,
    ) -> Result<BrokerComponent, AmqpError> {
        let (connection, shared) = {
            let link = parent.link();
            (link.connection.clone(), link.shared.clone())
        };

        let Some(shared) = shared.filter(|s| s.channel.is_open()) else {
            error!(parent = parent.name(), "cannot share a channel that is not open");
            return Err(AmqpError::ChannelNotReady(parent.name()));
        };

        Ok(BrokerComponent {
            name: RwLock::new(name.to_owned()),
            durable,
            settings: parent.settings.clone(),
            connector: None,
            role: Role::Dependent,
            link: Mutex::new(Link {
                connection,
                shared: Some(shared),
            }),
            open: AtomicBool::new(true),
            state: watch::Sender::new(ComponentState::Created),
            lost: watch::Sender::new(None),
        })
    }

    pub fn name(&self) -> String {
        match self.name.read() {
            Ok(name) => name.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub(crate) fn set_name(&self, name: &str) {
        match self.name.write() {
            Ok(mut current) => *current = name.to_owned(),
            Err(poisoned) => *poisoned.into_inner() = name.to_owned(),
        }
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Whether this component owns its connection and channel.
    pub fn is_owner(&self) -> bool {
        self.role == Role::Owner
    }

    pub fn state(&self) -> ComponentState {
        (*self.state.borrow()).clone()
    }

    /// The channel, once it is open and as long as the broker keeps it open.
    pub fn channel(&self) -> Option<Arc<dyn BrokerChannel>> {
        self.link()
            .shared
            .as_ref()
            .filter(|s| s.channel.is_open())
            .map(|s| s.channel.clone())
    }

    pub(crate) fn shared_channel(&self) -> Option<SharedChannel> {
        self.link().shared.clone()
    }

    /// Waits until the component is ready.
    ///
    /// # Errors
    /// The setup failure, `ChannelClosed` when the broker closed the channel
    /// and `ComponentClosed` when the component was closed.
    pub async fn ready(&self) -> Result<(), AmqpError> {
        let mut rx = self.state.subscribe();
        let state = rx
            .wait_for(|s| *s == ComponentState::Ready || s.is_terminal())
            .await
            .map(|s| (*s).clone())
            .map_err(|_| AmqpError::ComponentClosed(self.name()))?;

        match state {
            ComponentState::Ready => Ok(()),
            ComponentState::Failed(err) => Err(err),
            ComponentState::Dead(reason) => Err(AmqpError::ChannelClosed(reason)),
            _ => Err(AmqpError::ComponentClosed(self.name())),
        }
    }

    /// Waits until the component reaches a terminal state and answers it.
    pub async fn closed(&self) -> ComponentState {
        let mut rx = self.state.subscribe();
        let state = match rx.wait_for(|s| s.is_terminal()).await {
            Ok(state) => (*state).clone(),
            Err(_) => ComponentState::Closed,
        };
        state
    }

    /// Closes the channel then the connection, when this component owns
    /// them. Safe to call in any state, including before the channel is open.
    pub async fn close(&self) -> Result<(), AmqpError> {
        let (shared, connection) = {
            let mut link = self.link();
            self.state.send_replace(ComponentState::Closed);
            self.open.store(false, Ordering::SeqCst);
            let shared = link.shared.take();
            let connection = link.connection.take();
            match self.role {
                Role::Owner => (shared, connection),
                Role::Dependent => (None, None),
            }
        };
        debug!(name = self.name(), "closing component");

        let mut result = Ok(());
        if let Some(shared) = shared {
            if shared.channel.is_open() {
                if let Err(err) = shared.channel.close().await {
                    error!(error = err.to_string(), "failure to close the channel");
                    result = Err(err);
                }
            }
        }

        if let Some(connection) = connection {
            if connection.is_connected() {
                if let Err(err) = connection.close().await {
                    error!(error = err.to_string(), "failure to close the connection");
                    result = result.and(Err(err));
                }
            }
        }

        result
    }

    /// Invoked when the broker closes the channel, usually after a protocol
    /// violation such as re-declaring an exchange with other parameters. The
    /// component is dead afterwards and must be rebuilt, not reused.
    ///
    /// A setup failure reported first is kept as the terminal state; the
    /// connection is released either way.
    pub(crate) async fn on_channel_closed(&self, reason: &str) {
        info!(name = self.name(), reason, "channel was closed by the broker");
        if self.role == Role::Owner {
            self.lost.send_replace(Some(reason.to_owned()));
        }

        let connection = {
            let mut link = self.link();
            link.shared = None;
            let connection = link.connection.take();
            let was_open = self.open.swap(false, Ordering::SeqCst);
            self.state.send_if_modified(|state| {
                if state.is_terminal() {
                    return false;
                }
                *state = ComponentState::Dead(reason.to_owned());
                true
            });
            connection.filter(|_| was_open && self.role == Role::Owner)
        };

        if let Some(connection) = connection {
            if let Err(err) = connection.close().await {
                debug!(error = err.to_string(), "connection already gone");
            }
        }
    }

    fn link(&self) -> MutexGuard<'_, Link> {
        match self.link.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn transition(&self, next: ComponentState) -> Result<(), AmqpError> {
        let mut result = Ok(());
        self.state.send_if_modified(|state| {
            if state.is_terminal() {
                result = Err(AmqpError::ComponentClosed(self.name()));
                return false;
            }
            *state = next;
            true
        });
        result
    }

    fn fail(&self, err: AmqpError) {
        let reported = self.state.send_if_modified(|state| {
            if state.is_terminal() {
                return false;
            }
            *state = ComponentState::Failed(err.clone());
            true
        });

        if reported {
            error!(name = self.name(), error = err.to_string(), "component setup failed");
        } else {
            debug!(name = self.name(), error = err.to_string(), "setup interrupted");
        }
    }

    async fn connect(&self) -> Result<(SharedChannel, mpsc::UnboundedReceiver<BrokerEvent>), AmqpError> {
        let Some(connector) = self.connector.clone() else {
            return Err(AmqpError::ChannelNotReady(self.name()));
        };

        self.transition(ComponentState::Connecting)?;
        let (events, receiver) = mpsc::unbounded_channel();
        let connection = connector.connect(&self.settings, events.clone()).await?;
        info!(name = self.name(), "connection open successfully");

        if !self.adopt(|link| link.connection = Some(connection.clone())) {
            let _ = connection.close().await;
            return Err(AmqpError::ComponentClosed(self.name()));
        }

        let channel = connection.create_channel().await?;
        let shared = SharedChannel {
            channel,
            events,
            setup_lock: Arc::new(tokio::sync::Mutex::new(())),
            lost: self.lost.subscribe(),
        };

        if !self.adopt(|link| link.shared = Some(shared.clone())) {
            let _ = shared.channel.close().await;
            let _ = connection.close().await;
            return Err(AmqpError::ComponentClosed(self.name()));
        }
        self.open.store(true, Ordering::SeqCst);

        Ok((shared, receiver))
    }

    /// Stores a freshly opened resource unless the component was closed in
    /// the meantime, in which case the caller must release it.
    fn adopt(&self, apply: impl FnOnce(&mut Link)) -> bool {
        let mut link = self.link();
        if *self.state.borrow() == ComponentState::Closed {
            return false;
        }
        apply(&mut link);
        true
    }
}

/// The resource specific part of a component: what to assert once its
/// channel is open.
#[async_trait]
pub(crate) trait ComponentSetup: Send + Sync + 'static {
    fn component(&self) -> &BrokerComponent;

    async fn setup(&self, channel: &Arc<dyn BrokerChannel>) -> Result<(), AmqpError>;
}

/// Drives `target` to readiness in the background.
pub(crate) fn spawn_setup<T: ComponentSetup>(target: Arc<T>) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(err) = drive(&target).await {
            target.component().fail(err);
        }
    })
}

async fn drive<T: ComponentSetup>(target: &Arc<T>) -> Result<(), AmqpError> {
    let component = target.component();

    let shared = match component.shared_channel() {
        Some(shared) => {
            watch_shared_channel(target, shared.lost.clone());
            shared
        }
        None => {
            let (shared, receiver) = component.connect().await?;
            watch_broker_events(Arc::downgrade(target), receiver);
            shared
        }
    };
    component.transition(ComponentState::ChannelOpen)?;

    // one setup at a time per channel
    let _guard = shared.setup_lock.lock().await;
    if component.state().is_terminal() {
        return Err(AmqpError::ComponentClosed(component.name()));
    }

    target.setup(&shared.channel).await?;
    component.transition(ComponentState::Ready)?;
    debug!(name = component.name(), "component is ready");

    Ok(())
}

fn watch_broker_events<T: ComponentSetup>(
    target: Weak<T>,
    mut receiver: mpsc::UnboundedReceiver<BrokerEvent>,
) {
    tokio::spawn(async move {
        while let Some(event) = receiver.recv().await {
            let Some(target) = target.upgrade() else {
                break;
            };

            match event {
                BrokerEvent::ChannelClosed(reason) => {
                    target.component().on_channel_closed(&reason).await;
                    break;
                }
            }
        }
    });
}

/// Makes a dependent follow the channel it borrowed: once the owner learns
/// the broker closed it, the dependent is dead too.
fn watch_shared_channel<T: ComponentSetup>(
    target: &Arc<T>,
    mut lost: watch::Receiver<Option<String>>,
) {
    let mut own = target.component().state.subscribe();
    let target = Arc::downgrade(target);

    tokio::spawn(async move {
        loop {
            let reason = (*lost.borrow_and_update()).clone();
            if let Some(reason) = reason {
                if let Some(target) = target.upgrade() {
                    target.component().on_channel_closed(&reason).await;
                }
                return;
            }

            tokio::select! {
                changed = lost.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                changed = own.changed() => {
                    if changed.is_err() || own.borrow().is_terminal() {
                        return;
                    }
                }
            }
        }
    });
}
