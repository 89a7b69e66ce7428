//! The broker kernel: registration authority and routing hub.
//!
//! A root broker assigns global ids, matches interface registrations
//! across cores, runs the federation-wide init barrier, and fans out
//! disconnects and global errors. Non-root brokers forward whatever they
//! cannot resolve toward their parent.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use tokio::sync::{mpsc, oneshot};

use metronome_comms::KernelRole;
use metronome_core::{
    command::{Action, ActionMessage, MessageFlags},
    GlobalFederateId, GlobalHandle, RouteId,
};

use crate::{
    query::{self, QueryMode},
    KernelError,
};

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub name: String,
    pub root: bool,
    /// Federates the init barrier waits for.
    pub expected_federates: usize,
    /// When set, new registrations are redirected to this address instead
    /// of being accepted (the broker has been superseded or re-homed).
    pub redirect_address: Option<String>,
}

impl BrokerConfig {
    pub fn root(name: &str, expected_federates: usize) -> Self {
        BrokerConfig {
            name: name.to_string(),
            root: true,
            expected_federates,
            redirect_address: None,
        }
    }
}

pub type TransmitFn = Box<dyn Fn(RouteId, ActionMessage) + Send>;
pub type AddRouteFn = Box<dyn Fn(RouteId, String) + Send>;

enum BrokerEvent {
    Command(ActionMessage),
    Attach { transmit: TransmitFn, add_route: AddRouteFn, reply: oneshot::Sender<()> },
    Query { target: String, query: String, reply: oneshot::Sender<String> },
    Shutdown,
}

pub struct BrokerRole {
    name: String,
    sender: mpsc::UnboundedSender<BrokerEvent>,
}

impl KernelRole for BrokerRole {
    fn queue_command(&self, cmd: ActionMessage) {
        let _ = self.sender.send(BrokerEvent::Command(cmd));
    }

    fn name(&self) -> &str {
        &self.name
    }
}

pub struct Broker {
    name: String,
    sender: mpsc::UnboundedSender<BrokerEvent>,
    role: Arc<BrokerRole>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let role = Arc::new(BrokerRole { name: config.name.clone(), sender: sender.clone() });
        let name = config.name.clone();
        let state = BrokerState::new(config);
        let task = tokio::spawn(state.run(receiver));
        Broker { name, sender, role, task: Some(task) }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> Arc<BrokerRole> {
        self.role.clone()
    }

    /// Wire the broker to its comms interface.
    pub async fn attach_comms(
        &self,
        transmit: impl Fn(RouteId, ActionMessage) + Send + 'static,
        add_route: impl Fn(RouteId, String) + Send + 'static,
    ) -> Result<(), KernelError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(BrokerEvent::Attach {
                transmit: Box::new(transmit),
                add_route: Box::new(add_route),
                reply: tx,
            })
            .map_err(|_| KernelError::SystemFailure("broker has shut down".into()))?;
        rx.await.map_err(|_| KernelError::SystemFailure("broker dropped the request".into()))
    }

    pub async fn query(&self, target: &str, query: &str, _mode: QueryMode) -> String {
        let (tx, rx) = oneshot::channel();
        let event = BrokerEvent::Query {
            target: target.to_string(),
            query: query.to_string(),
            reply: tx,
        };
        if self.sender.send(event).is_err() {
            return query::error_body(500, "broker has shut down");
        }
        rx.await.unwrap_or_else(|_| query::error_body(500, "broker dropped the query"))
    }

    pub async fn shutdown(&mut self) {
        let _ = self.sender.send(BrokerEvent::Shutdown);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

struct CoreRecord {
    name: String,
    route: RouteId,
    disconnected: bool,
}

struct BrokerState {
    config: BrokerConfig,
    transmit: Option<TransmitFn>,
    add_route: Option<AddRouteFn>,
    cores: HashMap<GlobalFederateId, CoreRecord>,
    core_by_name: HashMap<String, GlobalFederateId>,
    /// Owning core of each federate.
    core_of_fed: HashMap<GlobalFederateId, GlobalFederateId>,
    fed_by_name: HashMap<String, GlobalFederateId>,
    publications: HashMap<String, (GlobalHandle, Vec<String>)>,
    endpoints: HashMap<String, GlobalHandle>,
    /// Subscriptions waiting for their publication to register.
    pending_subscriptions: HashMap<String, Vec<GlobalHandle>>,
    /// Endpoint links waiting for both ends.
    pending_links: Vec<(String, String)>,
    init_feds: HashSet<GlobalFederateId>,
    init_granted: bool,
    next_fed: i32,
    next_broker: i32,
    next_route: i32,
}

impl BrokerState {
    fn new(config: BrokerConfig) -> Self {
        BrokerState {
            config,
            transmit: None,
            add_route: None,
            cores: HashMap::new(),
            core_by_name: HashMap::new(),
            core_of_fed: HashMap::new(),
            fed_by_name: HashMap::new(),
            publications: HashMap::new(),
            endpoints: HashMap::new(),
            pending_subscriptions: HashMap::new(),
            pending_links: Vec::new(),
            init_feds: HashSet::new(),
            init_granted: false,
            next_fed: 0,
            next_broker: 2,
            next_route: 1,
        }
    }

    async fn run(mut self, mut events: mpsc::UnboundedReceiver<BrokerEvent>) {
        tracing::info!(broker = %self.config.name, "broker kernel started");
        while let Some(event) = events.recv().await {
            match event {
                BrokerEvent::Command(cmd) => self.process_command(cmd),
                BrokerEvent::Attach { transmit, add_route, reply } => {
                    self.transmit = Some(transmit);
                    self.add_route = Some(add_route);
                    let _ = reply.send(());
                }
                BrokerEvent::Query { target, query, reply } => {
                    let _ = reply.send(self.answer_query(&target, &query));
                }
                BrokerEvent::Shutdown => break,
            }
        }
        tracing::info!(broker = %self.config.name, "broker kernel stopped");
    }

    fn send(&self, route: RouteId, cmd: ActionMessage) {
        match &self.transmit {
            Some(transmit) => transmit(route, cmd),
            None => tracing::warn!(broker = %self.config.name, "no comms attached, dropping {cmd}"),
        }
    }

    fn route_of(&self, id: GlobalFederateId) -> Option<RouteId> {
        if let Some(core) = self.cores.get(&id) {
            return Some(core.route);
        }
        self.core_of_fed.get(&id).and_then(|core| self.cores.get(core)).map(|c| c.route)
    }

    fn route_by_dest(&self, cmd: ActionMessage) {
        match self.route_of(cmd.dest_id) {
            Some(route) => self.send(route, cmd),
            None if !self.config.root => self.send(RouteId::PARENT, cmd),
            None => {
                if !cmd.is_ignoreable_command() {
                    tracing::warn!(broker = %self.config.name, "unroutable command {cmd}");
                }
            }
        }
    }

    fn broadcast(&self, cmd: &ActionMessage) {
        for core in self.cores.values() {
            if !core.disconnected {
                self.send(core.route, cmd.clone());
            }
        }
    }

    fn process_command(&mut self, cmd: ActionMessage) {
        match cmd.action {
            Action::RegBroker => self.register_core(cmd),
            Action::RegFed => self.register_federate(cmd),
            Action::RegPub => self.register_publication(cmd),
            Action::RegEndpoint => self.register_endpoint(cmd),
            Action::RegInput => self.register_subscription(cmd),
            Action::AddEndpointLink => self.register_endpoint_link(cmd),
            Action::Init => self.handle_init(cmd),
            Action::SendMessage if !cmd.dest_id.is_valid() => {
                // name-addressed: resolve the destination endpoint here
                match self.endpoints.get(&cmd.name).copied() {
                    Some(target) => {
                        let mut cmd = cmd;
                        cmd.dest_id = target.fed;
                        cmd.dest_handle = target.handle;
                        self.route_by_dest(cmd);
                    }
                    None if !self.config.root => self.send(RouteId::PARENT, cmd),
                    None => {
                        tracing::warn!(
                            broker = %self.config.name,
                            endpoint = %cmd.name,
                            "message for unknown endpoint dropped"
                        );
                    }
                }
            }
            Action::Disconnect if !cmd.dest_id.is_valid() => self.handle_core_disconnect(cmd),
            Action::GlobalError => {
                tracing::error!(
                    broker = %self.config.name,
                    "global error {}: {}",
                    cmd.message_id,
                    cmd.payload.to_string_lossy()
                );
                self.broadcast(&cmd);
            }
            Action::Query | Action::OrderedQuery => self.handle_query_command(cmd),
            _ => self.route_by_dest(cmd),
        }
    }

    fn register_core(&mut self, cmd: ActionMessage) {
        let name = cmd.name.clone();
        let address = cmd.payload.to_string_lossy().into_owned();

        if let Some(redirect) = &self.config.redirect_address {
            // this broker has been superseded: point the peer elsewhere
            let route = RouteId(self.next_route);
            self.next_route += 1;
            if let Some(add_route) = &self.add_route {
                add_route(route, address);
            }
            let mut info = ActionMessage::protocol_priority(
                metronome_core::command::protocol::NEW_BROKER_INFORMATION,
            );
            info.string_data = vec![redirect.clone()];
            info.payload = redirect.as_str().into();
            self.send(route, info);
            return;
        }

        if self.core_by_name.contains_key(&name) {
            tracing::error!(broker = %self.config.name, core = %name, "duplicate core registration");
            let mut nack = ActionMessage::new(Action::BrokerAck);
            nack.name = name;
            nack.set_flag(MessageFlags::ERROR);
            // no route back beyond the address we were just given
            let route = RouteId(self.next_route);
            self.next_route += 1;
            if let Some(add_route) = &self.add_route {
                add_route(route, address);
            }
            self.send(route, nack);
            return;
        }

        let id = GlobalFederateId::new_broker(self.next_broker);
        self.next_broker += 1;
        let route = RouteId(self.next_route);
        self.next_route += 1;
        if let Some(add_route) = &self.add_route {
            add_route(route, address.clone());
        }
        self.cores.insert(id, CoreRecord { name: name.clone(), route, disconnected: false });
        self.core_by_name.insert(name.clone(), id);

        let mut ack = ActionMessage::new(Action::BrokerAck);
        ack.name = name;
        ack.dest_id = id;
        ack.source_id = GlobalFederateId::ROOT_BROKER;
        self.send(route, ack);
    }

    fn register_federate(&mut self, cmd: ActionMessage) {
        let core_id = cmd.source_id;
        let Some(route) = self.route_of(core_id) else {
            tracing::error!(broker = %self.config.name, "federate registration from unknown core");
            return;
        };
        let name = cmd.name.clone();
        if self.fed_by_name.contains_key(&name) {
            let mut nack = ActionMessage::new(Action::FedAck);
            nack.name = name;
            nack.set_flag(MessageFlags::ERROR);
            self.send(route, nack);
            return;
        }
        let id = GlobalFederateId::new_federate(self.next_fed);
        self.next_fed += 1;
        self.fed_by_name.insert(name.clone(), id);
        self.core_of_fed.insert(id, core_id);

        let mut ack = ActionMessage::new(Action::FedAck);
        ack.name = name;
        ack.dest_id = id;
        ack.source_id = GlobalFederateId::ROOT_BROKER;
        self.send(route, ack);
    }

    fn register_publication(&mut self, cmd: ActionMessage) {
        let key = cmd.name.clone();
        let publisher = GlobalHandle::new(cmd.source_id, cmd.source_handle);
        self.publications.insert(key.clone(), (publisher, cmd.string_data.clone()));
        if let Some(waiting) = self.pending_subscriptions.remove(&key) {
            for subscriber in waiting {
                self.link(publisher, subscriber, &cmd.string_data);
            }
        }
    }

    fn register_endpoint(&mut self, cmd: ActionMessage) {
        let name = cmd.name.clone();
        self.endpoints.insert(name, GlobalHandle::new(cmd.source_id, cmd.source_handle));
        let links = std::mem::take(&mut self.pending_links);
        for (source, dest) in links {
            self.try_link_endpoints(source, dest);
        }
    }

    fn register_subscription(&mut self, cmd: ActionMessage) {
        let key = cmd.name.clone();
        let subscriber = GlobalHandle::new(cmd.source_id, cmd.source_handle);
        match self.publications.get(&key) {
            Some((publisher, meta)) => {
                let publisher = *publisher;
                let meta = meta.clone();
                self.link(publisher, subscriber, &meta);
            }
            None => {
                self.pending_subscriptions.entry(key).or_default().push(subscriber);
            }
        }
    }

    /// Tell both owning cores about a matched publication/input pair.
    fn link(&self, publisher: GlobalHandle, subscriber: GlobalHandle, meta: &[String]) {
        let mut add_sub = ActionMessage::new(Action::AddSubscriber);
        add_sub.dest_id = publisher.fed;
        add_sub.dest_handle = publisher.handle;
        add_sub.source_id = subscriber.fed;
        add_sub.source_handle = subscriber.handle;
        self.route_by_dest(add_sub);

        let mut add_pub = ActionMessage::new(Action::AddPublisher);
        add_pub.dest_id = subscriber.fed;
        add_pub.dest_handle = subscriber.handle;
        add_pub.source_id = publisher.fed;
        add_pub.source_handle = publisher.handle;
        add_pub.string_data = meta.to_vec();
        self.route_by_dest(add_pub);
    }

    fn register_endpoint_link(&mut self, cmd: ActionMessage) {
        let source = cmd.name.clone();
        let dest = cmd.string_data.first().cloned().unwrap_or_default();
        self.try_link_endpoints(source, dest);
    }

    fn try_link_endpoints(&mut self, source: String, dest: String) {
        let (Some(src), Some(dst)) =
            (self.endpoints.get(&source).copied(), self.endpoints.get(&dest).copied())
        else {
            self.pending_links.push((source, dest));
            return;
        };
        if src.fed == dst.fed {
            return;
        }
        let mut add_dependent = ActionMessage::new(Action::AddDependent);
        add_dependent.dest_id = src.fed;
        add_dependent.source_id = dst.fed;
        self.route_by_dest(add_dependent);

        let mut add_dependency = ActionMessage::new(Action::AddDependency);
        add_dependency.dest_id = dst.fed;
        add_dependency.source_id = src.fed;
        self.route_by_dest(add_dependency);
    }

    fn handle_init(&mut self, cmd: ActionMessage) {
        if !self.config.root {
            self.send(RouteId::PARENT, cmd);
            return;
        }
        self.init_feds.insert(cmd.source_id);
        tracing::debug!(
            broker = %self.config.name,
            received = self.init_feds.len(),
            expected = self.config.expected_federates,
            "init barrier"
        );
        if !self.init_granted && self.init_feds.len() >= self.config.expected_federates {
            self.init_granted = true;
            tracing::info!(broker = %self.config.name, "all federates ready, granting init");
            self.broadcast(&ActionMessage::new(Action::InitGrant));
        }
    }

    fn handle_core_disconnect(&mut self, cmd: ActionMessage) {
        if let Some(core) = self.cores.get_mut(&cmd.source_id) {
            core.disconnected = true;
            tracing::info!(broker = %self.config.name, core = %core.name, "core disconnected");
        }
        if !self.cores.is_empty() && self.cores.values().all(|c| c.disconnected) {
            tracing::info!(broker = %self.config.name, "all cores disconnected");
        }
    }

    fn handle_query_command(&mut self, cmd: ActionMessage) {
        let target = cmd.name.clone();
        let is_local = target == "broker"
            || target == "federation"
            || target == "root"
            || target == self.config.name;
        if is_local {
            let body = self.answer_query(&target, &cmd.payload.to_string_lossy());
            let mut response = ActionMessage::new(match cmd.action {
                Action::OrderedQuery => Action::OrderedQueryReply,
                _ => Action::QueryReply,
            });
            response.dest_id = cmd.source_id;
            response.message_id = cmd.message_id;
            response.payload = body.into();
            self.route_by_dest(response);
            return;
        }
        // locate the owner and pass the query along unchanged
        let owner = self
            .fed_by_name
            .get(&target)
            .copied()
            .or_else(|| self.core_by_name.get(&target).copied());
        match owner.and_then(|id| self.route_of(id)) {
            Some(route) => self.send(route, cmd),
            None => {
                let mut response = ActionMessage::new(Action::QueryReply);
                response.dest_id = cmd.source_id;
                response.message_id = cmd.message_id;
                response.payload = query::not_found(&target).into();
                self.route_by_dest(response);
            }
        }
    }

    fn answer_query(&self, target: &str, query: &str) -> String {
        match query {
            "name" => serde_json::json!(self.config.name).to_string(),
            "isroot" => serde_json::json!(self.config.root).to_string(),
            "isinit" => serde_json::json!(self.init_granted).to_string(),
            "federates" => query::name_list(self.fed_by_name.keys().cloned()),
            "cores" => query::name_list(self.core_by_name.keys().cloned()),
            "publications" => query::name_list(self.publications.keys().cloned()),
            "endpoints" => query::name_list(self.endpoints.keys().cloned()),
            "version" => serde_json::json!(env!("CARGO_PKG_VERSION")).to_string(),
            _ => {
                let _ = target;
                query::unknown_query(query)
            }
        }
    }
}
