use crate::error::Error;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use proven_bus::constants::{
    DEAD_LETTER_ERROR_DESCRIPTION_HEADER, DEAD_LETTER_REASON_HEADER, DEFAULT_LOCK_DURATION,
    DEFAULT_MAX_DELIVERY_COUNT,
};
use proven_bus::{
    CorrelationFilter, Filter, Message, Properties, ReceiveMode, RuleDescription,
    dead_letter_path, subscription_path,
};
use tokio::sync::Notify;
use tokio::sync::futures::Notified;
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

/// Reason stamped on messages dead-lettered after too many deliveries.
pub const MAX_DELIVERY_COUNT_EXCEEDED: &str = "MaxDeliveryCountExceeded";

/// Behaviour of an in-memory namespace.
#[derive(Clone, Debug)]
pub struct MemoryConnectionOptions {
    /// How long a peek-lock delivery stays locked.
    pub lock_duration: Duration,

    /// How long an accepted session stays locked.
    pub session_lock_duration: Duration,

    /// Deliveries after which an abandoned message is dead-lettered.
    pub max_delivery_count: u32,

    /// Upper bound on how long a waiting receive sleeps between checks.
    pub poll_interval: Duration,
}

impl Default for MemoryConnectionOptions {
    fn default() -> Self {
        Self {
            lock_duration: DEFAULT_LOCK_DURATION,
            session_lock_duration: DEFAULT_LOCK_DURATION,
            max_delivery_count: DEFAULT_MAX_DELIVERY_COUNT,
            poll_interval: Duration::from_millis(50),
        }
    }
}

/// Which messages of an entity an operation may see.
#[derive(Clone, Copy, Debug)]
pub enum Scope<'a> {
    /// Messages without a session.
    Entity,

    /// Messages of one session, valid while `owner` holds its lock.
    Session { id: &'a str, owner: Uuid },
}

impl Scope<'_> {
    fn admits(self, message: &Message) -> bool {
        match self {
            Self::Entity => message.session_id.is_none(),
            Self::Session { id, .. } => message.session_id.as_deref() == Some(id),
        }
    }

    fn admits_peek(self, message: &Message) -> bool {
        match self {
            Self::Entity => true,
            Self::Session { .. } => self.admits(message),
        }
    }
}

fn deadline(now: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(duration)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn has_expired(message: &Message, now: DateTime<Utc>) -> bool {
    match (message.time_to_live, message.system_properties.enqueued_time_utc) {
        (Some(ttl), Some(enqueued)) => deadline(enqueued, ttl) <= now,
        _ => false,
    }
}

fn clear_lock(message: &mut Message) {
    message.system_properties.lock_token = None;
    message.system_properties.locked_until_utc = None;
}

fn correlation_matches(filter: &CorrelationFilter, message: &Message) -> bool {
    if filter
        .correlation_id
        .as_ref()
        .is_some_and(|id| message.correlation_id.as_ref() != Some(id))
    {
        return false;
    }

    if filter
        .label
        .as_ref()
        .is_some_and(|label| message.label.as_ref() != Some(label))
    {
        return false;
    }

    filter
        .properties
        .iter()
        .all(|(key, value)| message.properties.get(key) == Some(value))
}

// SQL expressions are not evaluated in memory and match everything.
fn filter_matches(filter: &Filter, message: &Message) -> bool {
    match filter {
        Filter::True | Filter::Sql(_) => true,
        Filter::False => false,
        Filter::Correlation(correlation) => correlation_matches(correlation, message),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Delivery {
    Available,
    Deferred,
    Locked {
        token: Uuid,
        until: DateTime<Utc>,
        deferred: bool,
    },
}

#[derive(Debug)]
struct Stored {
    message: Message,
    delivery: Delivery,
}

#[derive(Clone, Copy, Debug)]
struct SessionLock {
    owner: Uuid,
    until: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct SessionEntry {
    lock: Option<SessionLock>,
    state: Option<Bytes>,
}

impl SessionEntry {
    fn is_locked(&self, now: DateTime<Utc>) -> bool {
        self.lock.is_some_and(|lock| lock.until >= now)
    }
}

/// A queue, subscription or dead-letter queue messages are received from.
#[derive(Debug, Default)]
struct MessageQueue {
    messages: BTreeMap<i64, Stored>,
    rules: Option<BTreeMap<String, RuleDescription>>,
    sessions: HashMap<String, SessionEntry>,
}

impl MessageQueue {
    fn subscription() -> Self {
        let default_rule = RuleDescription::default();

        Self {
            rules: Some(BTreeMap::from([(default_rule.name.clone(), default_rule)])),
            ..Self::default()
        }
    }

    fn accepts(&self, message: &Message) -> bool {
        self.rules.as_ref().is_none_or(|rules| {
            rules
                .values()
                .any(|rule| filter_matches(&rule.filter, message))
        })
    }

    fn enqueue(&mut self, message: Message) {
        if let Some(sequence_number) = message.system_properties.sequence_number {
            self.messages.insert(
                sequence_number,
                Stored {
                    message,
                    delivery: Delivery::Available,
                },
            );
        }
    }

    fn expire(&mut self, now: DateTime<Utc>) {
        for stored in self.messages.values_mut() {
            if let Delivery::Locked {
                until, deferred, ..
            } = stored.delivery
            {
                if until < now {
                    stored.delivery = if deferred {
                        Delivery::Deferred
                    } else {
                        Delivery::Available
                    };
                    clear_lock(&mut stored.message);
                }
            }
        }

        self.messages.retain(|_, stored| {
            stored.delivery != Delivery::Available || !has_expired(&stored.message, now)
        });
    }

    fn check_scope(&self, scope: Scope<'_>, now: DateTime<Utc>) -> Result<(), Error> {
        if let Scope::Session { id, owner } = scope {
            let held = self
                .sessions
                .get(id)
                .and_then(|entry| entry.lock)
                .is_some_and(|lock| lock.owner == owner && lock.until >= now);

            if !held {
                return Err(Error::SessionLockLost(id.to_string()));
            }
        }

        Ok(())
    }

    fn session_mut(&mut self, scope: Scope<'_>) -> Option<&mut SessionEntry> {
        match scope {
            Scope::Entity => None,
            Scope::Session { id, .. } => self.sessions.get_mut(id),
        }
    }

    fn deliver(
        &mut self,
        sequence_number: i64,
        mode: ReceiveMode,
        now: DateTime<Utc>,
        lock_duration: Duration,
    ) -> Option<Message> {
        match mode {
            ReceiveMode::PeekLock => {
                let stored = self.messages.get_mut(&sequence_number)?;
                let token = Uuid::new_v4();
                let until = deadline(now, lock_duration);

                stored.delivery = Delivery::Locked {
                    token,
                    until,
                    deferred: stored.delivery == Delivery::Deferred,
                };
                stored.message.system_properties.delivery_count += 1;
                stored.message.system_properties.lock_token = Some(token);
                stored.message.system_properties.locked_until_utc = Some(until);

                Some(stored.message.clone())
            }
            ReceiveMode::ReceiveAndDelete => {
                let mut stored = self.messages.remove(&sequence_number)?;
                stored.message.system_properties.delivery_count += 1;

                Some(stored.message)
            }
        }
    }

    fn find_locked(&self, lock_token: Uuid) -> Result<i64, Error> {
        self.messages
            .iter()
            .find(|(_, stored)| {
                matches!(stored.delivery, Delivery::Locked { token, .. } if token == lock_token)
            })
            .map(|(sequence_number, _)| *sequence_number)
            .ok_or(Error::LockLost(lock_token))
    }

    fn next_available_session(&self, now: DateTime<Utc>) -> Option<String> {
        self.messages
            .values()
            .filter(|stored| stored.delivery == Delivery::Available)
            .filter_map(|stored| stored.message.session_id.as_deref())
            .find(|id| !self.sessions.get(*id).is_some_and(|entry| entry.is_locked(now)))
            .map(ToString::to_string)
    }
}

#[derive(Clone, Debug)]
enum Route {
    Queue,
    Topic(Vec<String>),
}

/// A queue or topic messages are sent to.
#[derive(Debug)]
struct SendTarget {
    route: Route,
    next_sequence_number: i64,
    scheduled: BTreeMap<i64, Message>,
}

impl SendTarget {
    const fn new(route: Route) -> Self {
        Self {
            route,
            next_sequence_number: 1,
            scheduled: BTreeMap::new(),
        }
    }

    fn stamp(&mut self, message: &mut Message) -> i64 {
        let sequence_number = self.next_sequence_number;
        self.next_sequence_number += 1;

        message.system_properties = proven_bus::SystemProperties {
            sequence_number: Some(sequence_number),
            ..proven_bus::SystemProperties::default()
        };

        sequence_number
    }
}

#[derive(Debug, Default)]
struct State {
    queues: HashMap<String, MessageQueue>,
    targets: HashMap<String, SendTarget>,
}

impl State {
    fn queue_mut(&mut self, path: &str) -> Result<&mut MessageQueue, Error> {
        self.queues
            .get_mut(path)
            .ok_or_else(|| Error::EntityNotFound(path.to_string()))
    }

    fn target_mut(&mut self, path: &str) -> Result<&mut SendTarget, Error> {
        self.targets
            .get_mut(path)
            .ok_or_else(|| Error::EntityNotFound(path.to_string()))
    }

    fn ensure_vacant(&self, path: &str) -> Result<(), Error> {
        if self.queues.contains_key(path) || self.targets.contains_key(path) {
            return Err(Error::EntityAlreadyExists(path.to_string()));
        }

        Ok(())
    }

    fn route(&mut self, path: &str, message: Message) {
        let destinations = match self.targets.get(path).map(|target| &target.route) {
            Some(Route::Queue) => vec![path.to_string()],
            Some(Route::Topic(subscriptions)) => subscriptions.clone(),
            None => return,
        };

        for destination in destinations {
            if let Some(queue) = self.queues.get_mut(&destination) {
                if queue.accepts(&message) {
                    queue.enqueue(message.clone());
                }
            }
        }
    }

    fn promote_due(&mut self, now: DateTime<Utc>) -> bool {
        let mut due = Vec::new();

        for (path, target) in &mut self.targets {
            let ready: Vec<i64> = target
                .scheduled
                .iter()
                .filter(|(_, message)| message.scheduled_enqueue_time_utc.is_none_or(|at| at <= now))
                .map(|(sequence_number, _)| *sequence_number)
                .collect();

            for sequence_number in ready {
                if let Some(mut message) = target.scheduled.remove(&sequence_number) {
                    message.system_properties.enqueued_time_utc = Some(now);
                    due.push((path.clone(), message));
                }
            }
        }

        let promoted = !due.is_empty();
        for (path, message) in due {
            self.route(&path, message);
        }

        promoted
    }

    fn dead_letter(
        &mut self,
        path: &str,
        sequence_number: i64,
        reason: Option<String>,
        description: Option<String>,
    ) -> Result<(), Error> {
        let dead_letter_queue = dead_letter_path(path);
        if !self.queues.contains_key(&dead_letter_queue) {
            return Err(Error::EntityNotFound(dead_letter_queue));
        }

        let Some(Stored { mut message, .. }) = self.queue_mut(path)?.messages.remove(&sequence_number)
        else {
            return Ok(());
        };

        clear_lock(&mut message);
        message.system_properties.dead_letter_source = Some(path.to_string());
        if let Some(reason) = reason {
            message
                .properties
                .insert(DEAD_LETTER_REASON_HEADER.to_string(), reason.into());
        }
        if let Some(description) = description {
            message.properties.insert(
                DEAD_LETTER_ERROR_DESCRIPTION_HEADER.to_string(),
                description.into(),
            );
        }

        self.queue_mut(&dead_letter_queue)?.enqueue(message);

        Ok(())
    }
}

/// Entities and messages shared by every connection to one namespace.
#[derive(Debug)]
pub struct Namespace {
    options: MemoryConnectionOptions,
    state: Mutex<State>,
    notify: Notify,
}

impl Namespace {
    pub fn new(options: MemoryConnectionOptions) -> Self {
        Self {
            options,
            state: Mutex::new(State::default()),
            notify: Notify::new(),
        }
    }

    pub const fn options(&self) -> &MemoryConnectionOptions {
        &self.options
    }

    pub fn notified(&self) -> Notified<'_> {
        self.notify.notified()
    }

    /// Retries `attempt` until it yields a value or `timeout` elapses, waking
    /// on every state change and at least every poll interval.
    pub async fn poll_until<T, F>(&self, timeout: Duration, mut attempt: F) -> Result<Option<T>, Error>
    where
        F: FnMut() -> Result<Option<T>, Error> + Send,
        T: Send,
    {
        let started = Instant::now();

        loop {
            let notified = self.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(value) = attempt()? {
                return Ok(Some(value));
            }

            let elapsed = started.elapsed();
            if elapsed >= timeout {
                return Ok(None);
            }

            let wait = (timeout - elapsed).min(self.options.poll_interval);
            let _ = tokio::time::timeout(wait, notified).await;
        }
    }

    pub fn create_queue(&self, path: &str) -> Result<(), Error> {
        let mut state = self.state.lock();
        state.ensure_vacant(path)?;

        state.queues.insert(path.to_string(), MessageQueue::default());
        state
            .queues
            .insert(dead_letter_path(path), MessageQueue::default());
        state
            .targets
            .insert(path.to_string(), SendTarget::new(Route::Queue));

        info!("created queue {path}");

        Ok(())
    }

    pub fn create_topic(&self, path: &str) -> Result<(), Error> {
        let mut state = self.state.lock();
        state.ensure_vacant(path)?;

        state
            .targets
            .insert(path.to_string(), SendTarget::new(Route::Topic(Vec::new())));

        info!("created topic {path}");

        Ok(())
    }

    pub fn create_subscription(&self, topic_path: &str, name: &str) -> Result<String, Error> {
        let path = subscription_path(topic_path, name)
            .map_err(|e| Error::InvalidEntityPath(e.to_string()))?;

        let mut state = self.state.lock();
        state.ensure_vacant(&path)?;

        let Route::Topic(subscriptions) = &mut state.target_mut(topic_path)?.route else {
            return Err(Error::EntityNotFound(topic_path.to_string()));
        };
        subscriptions.push(path.clone());

        state.queues.insert(path.clone(), MessageQueue::subscription());
        state
            .queues
            .insert(dead_letter_path(&path), MessageQueue::default());

        info!("created subscription {path}");

        Ok(path)
    }

    pub fn has_queue(&self, path: &str) -> bool {
        self.state.lock().queues.contains_key(path)
    }

    pub fn has_target(&self, path: &str) -> bool {
        self.state.lock().targets.contains_key(path)
    }

    pub fn has_rules(&self, path: &str) -> bool {
        self.state
            .lock()
            .queues
            .get(path)
            .is_some_and(|queue| queue.rules.is_some())
    }

    pub fn send(&self, path: &str, messages: Vec<Message>) -> Result<(), Error> {
        let now = Utc::now();
        let mut state = self.state.lock();
        let target = state.target_mut(path)?;

        let mut ready = Vec::with_capacity(messages.len());
        for mut message in messages {
            let sequence_number = target.stamp(&mut message);

            if message.scheduled_enqueue_time_utc.is_some_and(|at| at > now) {
                target.scheduled.insert(sequence_number, message);
            } else {
                message.system_properties.enqueued_time_utc = Some(now);
                ready.push(message);
            }
        }

        debug!("{path} accepted {} message(s)", ready.len());

        for message in ready {
            state.route(path, message);
        }
        drop(state);

        self.notify.notify_waiters();

        Ok(())
    }

    pub fn schedule(&self, path: &str, mut message: Message) -> Result<i64, Error> {
        let mut state = self.state.lock();
        let target = state.target_mut(path)?;

        let sequence_number = target.stamp(&mut message);
        target.scheduled.insert(sequence_number, message);

        debug!("{path} scheduled message {sequence_number}");

        Ok(sequence_number)
    }

    pub fn cancel_scheduled(&self, path: &str, sequence_number: i64) -> Result<(), Error> {
        self.state
            .lock()
            .target_mut(path)?
            .scheduled
            .remove(&sequence_number)
            .map(|_| ())
            .ok_or(Error::MessageNotFound(sequence_number))
    }

    pub fn receive(
        &self,
        path: &str,
        scope: Scope<'_>,
        mode: ReceiveMode,
        max_count: usize,
    ) -> Result<Vec<Message>, Error> {
        let now = Utc::now();
        let mut state = self.state.lock();
        state.promote_due(now);

        let queue = state.queue_mut(path)?;
        queue.check_scope(scope, now)?;
        queue.expire(now);

        let sequence_numbers: Vec<i64> = queue
            .messages
            .iter()
            .filter(|(_, stored)| stored.delivery == Delivery::Available)
            .filter(|(_, stored)| scope.admits(&stored.message))
            .map(|(sequence_number, _)| *sequence_number)
            .take(max_count)
            .collect();

        Ok(sequence_numbers
            .into_iter()
            .filter_map(|sequence_number| {
                queue.deliver(sequence_number, mode, now, self.options.lock_duration)
            })
            .collect())
    }

    pub fn receive_deferred(
        &self,
        path: &str,
        scope: Scope<'_>,
        mode: ReceiveMode,
        sequence_numbers: &[i64],
    ) -> Result<Vec<Message>, Error> {
        let now = Utc::now();
        let mut state = self.state.lock();

        let queue = state.queue_mut(path)?;
        queue.check_scope(scope, now)?;
        queue.expire(now);

        let deferred: Vec<i64> = sequence_numbers
            .iter()
            .copied()
            .filter(|sequence_number| {
                queue.messages.get(sequence_number).is_some_and(|stored| {
                    stored.delivery == Delivery::Deferred && scope.admits(&stored.message)
                })
            })
            .collect();

        Ok(deferred
            .into_iter()
            .filter_map(|sequence_number| {
                queue.deliver(sequence_number, mode, now, self.options.lock_duration)
            })
            .collect())
    }

    pub fn peek(
        &self,
        path: &str,
        scope: Scope<'_>,
        from_sequence_number: i64,
        max_count: usize,
    ) -> Result<Vec<Message>, Error> {
        let now = Utc::now();
        let mut state = self.state.lock();
        state.promote_due(now);

        let queue = state.queue_mut(path)?;
        queue.check_scope(scope, now)?;
        queue.expire(now);

        Ok(queue
            .messages
            .range(from_sequence_number..)
            .map(|(_, stored)| &stored.message)
            .filter(|message| scope.admits_peek(message))
            .take(max_count)
            .map(|message| {
                let mut message = message.clone();
                clear_lock(&mut message);
                message
            })
            .collect())
    }

    pub fn complete(&self, path: &str, scope: Scope<'_>, lock_tokens: &[Uuid]) -> Result<(), Error> {
        let now = Utc::now();
        let mut state = self.state.lock();

        let queue = state.queue_mut(path)?;
        queue.check_scope(scope, now)?;
        queue.expire(now);

        let sequence_numbers = lock_tokens
            .iter()
            .copied()
            .collect::<HashSet<_>>()
            .into_iter()
            .map(|token| queue.find_locked(token))
            .collect::<Result<Vec<_>, _>>()?;

        for sequence_number in sequence_numbers {
            queue.messages.remove(&sequence_number);
        }

        Ok(())
    }

    pub fn abandon(
        &self,
        path: &str,
        scope: Scope<'_>,
        lock_token: Uuid,
        properties_to_modify: Option<Properties>,
    ) -> Result<(), Error> {
        let now = Utc::now();
        let mut state = self.state.lock();

        let queue = state.queue_mut(path)?;
        queue.check_scope(scope, now)?;
        queue.expire(now);

        let sequence_number = queue.find_locked(lock_token)?;
        let Some(stored) = queue.messages.get_mut(&sequence_number) else {
            return Err(Error::LockLost(lock_token));
        };

        stored
            .message
            .properties
            .extend(properties_to_modify.unwrap_or_default());
        clear_lock(&mut stored.message);

        let deferred = matches!(stored.delivery, Delivery::Locked { deferred: true, .. });
        let exhausted =
            stored.message.system_properties.delivery_count >= self.options.max_delivery_count;

        if !deferred && exhausted {
            debug!("message {sequence_number} on {path} exceeded its delivery count");
            state.dead_letter(
                path,
                sequence_number,
                Some(MAX_DELIVERY_COUNT_EXCEEDED.to_string()),
                None,
            )?;
        } else {
            stored.delivery = if deferred {
                Delivery::Deferred
            } else {
                Delivery::Available
            };
        }
        drop(state);

        self.notify.notify_waiters();

        Ok(())
    }

    pub fn defer(
        &self,
        path: &str,
        scope: Scope<'_>,
        lock_token: Uuid,
        properties_to_modify: Option<Properties>,
    ) -> Result<(), Error> {
        let now = Utc::now();
        let mut state = self.state.lock();

        let queue = state.queue_mut(path)?;
        queue.check_scope(scope, now)?;
        queue.expire(now);

        let sequence_number = queue.find_locked(lock_token)?;
        if let Some(stored) = queue.messages.get_mut(&sequence_number) {
            stored
                .message
                .properties
                .extend(properties_to_modify.unwrap_or_default());
            clear_lock(&mut stored.message);
            stored.delivery = Delivery::Deferred;
        }

        Ok(())
    }

    pub fn dead_letter(
        &self,
        path: &str,
        scope: Scope<'_>,
        lock_token: Uuid,
        reason: Option<String>,
        description: Option<String>,
    ) -> Result<(), Error> {
        let now = Utc::now();
        let mut state = self.state.lock();

        let queue = state.queue_mut(path)?;
        queue.check_scope(scope, now)?;
        queue.expire(now);

        let sequence_number = queue.find_locked(lock_token)?;
        state.dead_letter(path, sequence_number, reason, description)?;
        drop(state);

        self.notify.notify_waiters();

        Ok(())
    }

    pub fn renew_lock(
        &self,
        path: &str,
        scope: Scope<'_>,
        lock_token: Uuid,
    ) -> Result<DateTime<Utc>, Error> {
        let now = Utc::now();
        let mut state = self.state.lock();

        let queue = state.queue_mut(path)?;
        queue.check_scope(scope, now)?;
        queue.expire(now);

        let sequence_number = queue.find_locked(lock_token)?;
        let until = deadline(now, self.options.lock_duration);

        if let Some(stored) = queue.messages.get_mut(&sequence_number) {
            if let Delivery::Locked { deferred, .. } = stored.delivery {
                stored.delivery = Delivery::Locked {
                    token: lock_token,
                    until,
                    deferred,
                };
            }
            stored.message.system_properties.locked_until_utc = Some(until);
        }

        Ok(until)
    }

    /// Locks `session_id`, or the next session with available messages, for
    /// `owner`. Returns `None` if there is no such session right now.
    pub fn accept_session(
        &self,
        path: &str,
        session_id: Option<&str>,
        owner: Uuid,
    ) -> Result<Option<(String, DateTime<Utc>)>, Error> {
        let now = Utc::now();
        let mut state = self.state.lock();
        state.promote_due(now);

        let queue = state.queue_mut(path)?;
        queue.expire(now);

        let id = match session_id {
            Some(id) => {
                let taken = queue
                    .sessions
                    .get(id)
                    .and_then(|entry| entry.lock)
                    .is_some_and(|lock| lock.until >= now && lock.owner != owner);

                if taken {
                    return Err(Error::SessionCannotBeLocked(id.to_string()));
                }

                id.to_string()
            }
            None => match queue.next_available_session(now) {
                Some(id) => id,
                None => return Ok(None),
            },
        };

        let until = deadline(now, self.options.session_lock_duration);
        queue.sessions.entry(id.clone()).or_default().lock = Some(SessionLock { owner, until });

        debug!("session {id} on {path} locked until {until}");

        Ok(Some((id, until)))
    }

    pub fn renew_session_lock(&self, path: &str, id: &str, owner: Uuid) -> Result<DateTime<Utc>, Error> {
        let now = Utc::now();
        let mut state = self.state.lock();

        let scope = Scope::Session { id, owner };
        let queue = state.queue_mut(path)?;
        queue.check_scope(scope, now)?;

        let until = deadline(now, self.options.session_lock_duration);
        if let Some(entry) = queue.session_mut(scope) {
            entry.lock = Some(SessionLock { owner, until });
        }

        Ok(until)
    }

    pub fn release_session(&self, path: &str, id: &str, owner: Uuid) -> Result<(), Error> {
        let mut state = self.state.lock();

        let sessions = &mut state.queue_mut(path)?.sessions;
        if let Some(entry) = sessions.get_mut(id) {
            if entry.lock.is_some_and(|lock| lock.owner == owner) {
                entry.lock = None;
            }

            if entry.lock.is_none() && entry.state.is_none() {
                sessions.remove(id);
            }
        }
        drop(state);

        self.notify.notify_waiters();

        Ok(())
    }

    pub fn session_state(&self, path: &str, id: &str, owner: Uuid) -> Result<Option<Bytes>, Error> {
        let now = Utc::now();
        let mut state = self.state.lock();

        let scope = Scope::Session { id, owner };
        let queue = state.queue_mut(path)?;
        queue.check_scope(scope, now)?;

        Ok(queue.session_mut(scope).and_then(|entry| entry.state.clone()))
    }

    pub fn set_session_state(
        &self,
        path: &str,
        id: &str,
        owner: Uuid,
        session_state: Option<Bytes>,
    ) -> Result<(), Error> {
        let now = Utc::now();
        let mut state = self.state.lock();

        let scope = Scope::Session { id, owner };
        let queue = state.queue_mut(path)?;
        queue.check_scope(scope, now)?;

        if let Some(entry) = queue.session_mut(scope) {
            entry.state = session_state;
        }

        Ok(())
    }

    pub fn add_rule(&self, path: &str, rule: RuleDescription) -> Result<(), Error> {
        let mut state = self.state.lock();
        let rules = state
            .queue_mut(path)?
            .rules
            .as_mut()
            .ok_or_else(|| Error::EntityNotFound(path.to_string()))?;

        if rules.contains_key(&rule.name) {
            return Err(Error::RuleAlreadyExists(rule.name));
        }

        info!("added rule {} to {path}", rule.name);
        rules.insert(rule.name.clone(), rule);

        Ok(())
    }

    pub fn remove_rule(&self, path: &str, name: &str) -> Result<(), Error> {
        let mut state = self.state.lock();

        state
            .queue_mut(path)?
            .rules
            .as_mut()
            .ok_or_else(|| Error::EntityNotFound(path.to_string()))?
            .remove(name)
            .ok_or_else(|| Error::RuleNotFound(name.to_string()))?;

        info!("removed rule {name} from {path}");

        Ok(())
    }

    pub fn rules(&self, path: &str) -> Result<Vec<RuleDescription>, Error> {
        let mut state = self.state.lock();

        Ok(state
            .queue_mut(path)?
            .rules
            .as_ref()
            .ok_or_else(|| Error::EntityNotFound(path.to_string()))?
            .values()
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use assert_matches::assert_matches;
    use proven_bus::PropertyValue;

    fn namespace() -> Namespace {
        Namespace::new(MemoryConnectionOptions::default())
    }

    #[test]
    fn test_sequence_numbers_start_at_one() {
        let namespace = namespace();
        namespace.create_queue("orders").unwrap();

        namespace
            .send("orders", vec![Message::new("a"), Message::new("b")])
            .unwrap();

        let peeked = namespace.peek("orders", Scope::Entity, 0, 10).unwrap();
        let sequence_numbers: Vec<_> = peeked.iter().filter_map(Message::sequence_number).collect();
        assert_eq!(sequence_numbers, vec![1, 2]);
    }

    #[test]
    fn test_topic_fans_out_to_matching_subscriptions() {
        let namespace = namespace();
        namespace.create_topic("events").unwrap();
        let all = namespace.create_subscription("events", "all").unwrap();
        let red = namespace.create_subscription("events", "red").unwrap();

        namespace.remove_rule(&red, "$Default").unwrap();
        namespace
            .add_rule(
                &red,
                RuleDescription::new(
                    "red-only",
                    Filter::Correlation(CorrelationFilter {
                        label: Some("red".to_string()),
                        ..CorrelationFilter::default()
                    }),
                ),
            )
            .unwrap();

        namespace
            .send(
                "events",
                vec![Message::new("1").with_label("red"), Message::new("2").with_label("blue")],
            )
            .unwrap();

        assert_eq!(namespace.peek(&all, Scope::Entity, 0, 10).unwrap().len(), 2);

        let red_messages = namespace.peek(&red, Scope::Entity, 0, 10).unwrap();
        assert_eq!(red_messages.len(), 1);
        assert_eq!(red_messages[0].label.as_deref(), Some("red"));
    }

    #[test]
    fn test_subscription_without_rules_receives_nothing() {
        let namespace = namespace();
        namespace.create_topic("events").unwrap();
        let path = namespace.create_subscription("events", "muted").unwrap();
        namespace.remove_rule(&path, "$Default").unwrap();

        namespace.send("events", vec![Message::new("x")]).unwrap();

        assert!(namespace.peek(&path, Scope::Entity, 0, 10).unwrap().is_empty());
    }

    #[test]
    fn test_duplicate_and_missing_rules() {
        let namespace = namespace();
        namespace.create_topic("events").unwrap();
        let path = namespace.create_subscription("events", "sub").unwrap();

        assert_matches!(
            namespace.add_rule(&path, RuleDescription::default()),
            Err(Error::RuleAlreadyExists(name)) if name == "$Default"
        );
        assert_matches!(
            namespace.remove_rule(&path, "missing"),
            Err(Error::RuleNotFound(_))
        );
    }

    #[test]
    fn test_queue_has_no_rules() {
        let namespace = namespace();
        namespace.create_queue("orders").unwrap();

        assert!(!namespace.has_rules("orders"));
        assert_matches!(namespace.rules("orders"), Err(Error::EntityNotFound(_)));
    }

    #[test]
    fn test_complete_twice_loses_lock() {
        let namespace = namespace();
        namespace.create_queue("orders").unwrap();
        namespace.send("orders", vec![Message::new("a")]).unwrap();

        let received = namespace
            .receive("orders", Scope::Entity, ReceiveMode::PeekLock, 1)
            .unwrap();
        let token = received[0].lock_token().unwrap();

        namespace.complete("orders", Scope::Entity, &[token]).unwrap();
        assert_matches!(
            namespace.complete("orders", Scope::Entity, &[token]),
            Err(Error::LockLost(t)) if t == token
        );
    }

    #[test]
    fn test_failed_batch_complete_settles_nothing() {
        let namespace = namespace();
        namespace.create_queue("orders").unwrap();
        namespace.send("orders", vec![Message::new("a")]).unwrap();

        let received = namespace
            .receive("orders", Scope::Entity, ReceiveMode::PeekLock, 1)
            .unwrap();
        let token = received[0].lock_token().unwrap();

        assert_matches!(
            namespace.complete("orders", Scope::Entity, &[token, Uuid::new_v4()]),
            Err(Error::LockLost(_))
        );
        namespace.complete("orders", Scope::Entity, &[token]).unwrap();
    }

    #[test]
    fn test_abandon_past_max_delivery_count_dead_letters() {
        let namespace = Namespace::new(MemoryConnectionOptions {
            max_delivery_count: 2,
            ..MemoryConnectionOptions::default()
        });
        namespace.create_queue("orders").unwrap();
        namespace.send("orders", vec![Message::new("a")]).unwrap();

        for _ in 0..2 {
            let received = namespace
                .receive("orders", Scope::Entity, ReceiveMode::PeekLock, 1)
                .unwrap();
            namespace
                .abandon("orders", Scope::Entity, received[0].lock_token().unwrap(), None)
                .unwrap();
        }

        assert!(namespace.peek("orders", Scope::Entity, 0, 10).unwrap().is_empty());

        let dead = namespace
            .peek("orders/$DeadLetterQueue", Scope::Entity, 0, 10)
            .unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(
            dead[0].properties.get(DEAD_LETTER_REASON_HEADER),
            Some(&PropertyValue::from(MAX_DELIVERY_COUNT_EXCEEDED))
        );
        assert_eq!(dead[0].system_properties.dead_letter_source.as_deref(), Some("orders"));
    }

    #[test]
    fn test_abandon_applies_properties() {
        let namespace = namespace();
        namespace.create_queue("orders").unwrap();
        namespace.send("orders", vec![Message::new("a")]).unwrap();

        let received = namespace
            .receive("orders", Scope::Entity, ReceiveMode::PeekLock, 1)
            .unwrap();
        namespace
            .abandon(
                "orders",
                Scope::Entity,
                received[0].lock_token().unwrap(),
                Some(Properties::from([("attempt".to_string(), PropertyValue::Int(1))])),
            )
            .unwrap();

        let again = namespace
            .receive("orders", Scope::Entity, ReceiveMode::PeekLock, 1)
            .unwrap();
        assert_eq!(again[0].properties.get("attempt"), Some(&PropertyValue::Int(1)));
        assert_eq!(again[0].system_properties.delivery_count, 2);
    }

    #[test]
    fn test_expired_lock_makes_message_available() {
        let namespace = Namespace::new(MemoryConnectionOptions {
            lock_duration: Duration::ZERO,
            ..MemoryConnectionOptions::default()
        });
        namespace.create_queue("orders").unwrap();
        namespace.send("orders", vec![Message::new("a")]).unwrap();

        let first = namespace
            .receive("orders", Scope::Entity, ReceiveMode::PeekLock, 1)
            .unwrap();
        std::thread::sleep(Duration::from_millis(5));

        let second = namespace
            .receive("orders", Scope::Entity, ReceiveMode::PeekLock, 1)
            .unwrap();
        assert_eq!(second.len(), 1);
        assert_ne!(first[0].lock_token(), second[0].lock_token());
        assert_matches!(
            namespace.complete("orders", Scope::Entity, &[first[0].lock_token().unwrap()]),
            Err(Error::LockLost(_))
        );
    }

    #[test]
    fn test_scheduled_message_is_hidden_until_due() {
        let namespace = namespace();
        namespace.create_queue("orders").unwrap();

        let mut later = Message::new("later");
        later.scheduled_enqueue_time_utc = Some(Utc::now() + TimeDelta::hours(1));
        let sequence_number = namespace.schedule("orders", later).unwrap();

        assert!(namespace.peek("orders", Scope::Entity, 0, 10).unwrap().is_empty());

        namespace.cancel_scheduled("orders", sequence_number).unwrap();
        assert_matches!(
            namespace.cancel_scheduled("orders", sequence_number),
            Err(Error::MessageNotFound(n)) if n == sequence_number
        );
    }

    #[test]
    fn test_due_scheduled_message_is_promoted() {
        let namespace = namespace();
        namespace.create_queue("orders").unwrap();

        let mut now = Message::new("now");
        now.scheduled_enqueue_time_utc = Some(Utc::now());
        namespace.schedule("orders", now).unwrap();

        let received = namespace
            .receive("orders", Scope::Entity, ReceiveMode::ReceiveAndDelete, 10)
            .unwrap();
        assert_eq!(received.len(), 1);
        assert!(received[0].system_properties.enqueued_time_utc.is_some());
    }

    #[test]
    fn test_expired_time_to_live_drops_message() {
        let namespace = namespace();
        namespace.create_queue("orders").unwrap();
        namespace
            .send("orders", vec![Message::new("a").with_time_to_live(Duration::ZERO)])
            .unwrap();

        assert!(
            namespace
                .receive("orders", Scope::Entity, ReceiveMode::PeekLock, 1)
                .unwrap()
                .is_empty()
        );
    }

    #[test]
    fn test_session_lock_is_exclusive() {
        let namespace = namespace();
        namespace.create_queue("orders").unwrap();
        namespace
            .send("orders", vec![Message::new("a").with_session_id("s1")])
            .unwrap();

        let first_owner = Uuid::new_v4();
        let (id, _) = namespace
            .accept_session("orders", None, first_owner)
            .unwrap()
            .unwrap();
        assert_eq!(id, "s1");

        assert_matches!(
            namespace.accept_session("orders", Some("s1"), Uuid::new_v4()),
            Err(Error::SessionCannotBeLocked(_))
        );
        assert_eq!(namespace.accept_session("orders", None, Uuid::new_v4()).unwrap(), None);

        namespace.release_session("orders", "s1", first_owner).unwrap();
        assert!(namespace.accept_session("orders", None, Uuid::new_v4()).unwrap().is_some());
    }

    #[test]
    fn test_session_messages_are_scoped() {
        let namespace = namespace();
        namespace.create_queue("orders").unwrap();
        namespace
            .send(
                "orders",
                vec![
                    Message::new("plain"),
                    Message::new("a").with_session_id("s1"),
                    Message::new("b").with_session_id("s2"),
                ],
            )
            .unwrap();

        let plain = namespace
            .receive("orders", Scope::Entity, ReceiveMode::PeekLock, 10)
            .unwrap();
        assert_eq!(plain.len(), 1);
        assert_eq!(plain[0].session_id, None);

        let owner = Uuid::new_v4();
        namespace.accept_session("orders", Some("s2"), owner).unwrap();
        let scope = Scope::Session { id: "s2", owner };
        let scoped = namespace
            .receive("orders", scope, ReceiveMode::PeekLock, 10)
            .unwrap();
        assert_eq!(scoped.len(), 1);
        assert_eq!(scoped[0].session_id.as_deref(), Some("s2"));
    }

    #[test]
    fn test_session_operations_require_lock() {
        let namespace = namespace();
        namespace.create_queue("orders").unwrap();

        let owner = Uuid::new_v4();
        namespace.accept_session("orders", Some("s1"), owner).unwrap();
        namespace
            .set_session_state("orders", "s1", owner, Some(Bytes::from("checkpoint")))
            .unwrap();
        assert_eq!(
            namespace.session_state("orders", "s1", owner).unwrap(),
            Some(Bytes::from("checkpoint"))
        );

        assert_matches!(
            namespace.session_state("orders", "s1", Uuid::new_v4()),
            Err(Error::SessionLockLost(_))
        );
    }

    #[test]
    fn test_release_prunes_stateless_sessions() {
        let namespace = namespace();
        namespace.create_queue("orders").unwrap();

        let owner = Uuid::new_v4();
        namespace.accept_session("orders", Some("s1"), owner).unwrap();
        namespace.release_session("orders", "s1", owner).unwrap();
        assert!(!namespace.state.lock().queues["orders"].sessions.contains_key("s1"));

        let owner = Uuid::new_v4();
        namespace.accept_session("orders", Some("s2"), owner).unwrap();
        namespace
            .set_session_state("orders", "s2", owner, Some(Bytes::from("checkpoint")))
            .unwrap();
        namespace.release_session("orders", "s2", owner).unwrap();
        assert!(namespace.state.lock().queues["orders"].sessions.contains_key("s2"));

        let owner = Uuid::new_v4();
        namespace.accept_session("orders", Some("s2"), owner).unwrap();
        assert_eq!(
            namespace.session_state("orders", "s2", owner).unwrap(),
            Some(Bytes::from("checkpoint"))
        );
    }

    #[test]
    fn test_unknown_entities() {
        let namespace = namespace();

        assert_matches!(
            namespace.send("missing", vec![Message::new("a")]),
            Err(Error::EntityNotFound(_))
        );
        assert_matches!(
            namespace.create_subscription("missing", "sub"),
            Err(Error::EntityNotFound(_))
        );

        namespace.create_queue("orders").unwrap();
        assert_matches!(
            namespace.create_queue("orders"),
            Err(Error::EntityAlreadyExists(_))
        );
    }
}
