//! The core kernel: hosts federates, owns their time coordinators and
//! interface registrations, routes data locally, and forwards everything
//! else to the parent broker.
//!
//! The kernel runs as a single command-processing task. Commands arrive
//! from the comms layer (via [`CoreRole`]) and from the federate-facing
//! async API (via [`Federate`]); coordinator state is only ever touched by
//! the processing task.

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use tokio::sync::{mpsc, oneshot};

use metronome_comms::KernelRole;
use metronome_core::{
    command::{Action, ActionMessage, MessageFlags},
    GlobalFederateId, GlobalHandle, InterfaceHandle, SmallBuffer, Time,
};

use crate::{
    config::FederateTimingConfig,
    coordinator::{IterationRequest, IterationState, TimeCoordinator, TimeProcessResult},
    filter::{FilterOperator, FilterPlacement, FilterRegistry},
    message::EndpointMessage,
    query::{self, QueryMode},
    translator::TranslatorOperator,
    KernelError,
};

/// Result of a time request: the granted time, how the grant resolved, and
/// which inputs picked up new values at or before the grant.
#[derive(Debug)]
pub struct TimeGrant {
    pub time: Time,
    pub state: IterationState,
    pub updated_inputs: Vec<InterfaceHandle>,
}

#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub name: String,
    /// No parent broker; the core coordinates its federates by itself.
    pub standalone: bool,
}

impl CoreConfig {
    pub fn standalone(name: &str) -> Self {
        CoreConfig { name: name.to_string(), standalone: true }
    }

    pub fn with_broker(name: &str) -> Self {
        CoreConfig { name: name.to_string(), standalone: false }
    }
}

pub type TransmitFn = Box<dyn Fn(ActionMessage) + Send>;

enum CoreEvent {
    Command(ActionMessage),
    Api(ApiRequest),
}

type Reply<T> = oneshot::Sender<Result<T, KernelError>>;

enum ApiRequest {
    AttachParent {
        transmit: TransmitFn,
        advertised_address: String,
        reply: Reply<()>,
    },
    RegisterFederate {
        name: String,
        config: FederateTimingConfig,
        reply: Reply<GlobalFederateId>,
    },
    RegisterPublication {
        fed: GlobalFederateId,
        key: String,
        data_type: String,
        units: String,
        reply: Reply<InterfaceHandle>,
    },
    RegisterInput {
        fed: GlobalFederateId,
        name: String,
        reply: Reply<InterfaceHandle>,
    },
    AddSubscription {
        fed: GlobalFederateId,
        input: InterfaceHandle,
        pub_key: String,
        reply: Reply<()>,
    },
    RegisterEndpoint {
        fed: GlobalFederateId,
        name: String,
        reply: Reply<InterfaceHandle>,
    },
    AddEndpointLink {
        source: String,
        dest: String,
        reply: Reply<()>,
    },
    RegisterFilter {
        fed: GlobalFederateId,
        name: String,
        placement: FilterPlacement,
        target_endpoint: String,
        reply: Reply<GlobalHandle>,
    },
    SetFilterOperator {
        handle: GlobalHandle,
        operator: FilterOperator,
        reply: Reply<()>,
    },
    RegisterTranslator {
        fed: GlobalFederateId,
        name: String,
        operator: TranslatorOperator,
        reply: Reply<InterfaceHandle>,
    },
    Publish {
        fed: GlobalFederateId,
        handle: InterfaceHandle,
        data: SmallBuffer,
        reply: Reply<()>,
    },
    SendMessage {
        fed: GlobalFederateId,
        endpoint: InterfaceHandle,
        dest: String,
        data: SmallBuffer,
        reply: Reply<()>,
    },
    EnterInitializing {
        fed: GlobalFederateId,
        reply: Reply<()>,
    },
    EnterExecuting {
        fed: GlobalFederateId,
        iterate: IterationRequest,
        reply: Reply<IterationState>,
    },
    RequestTime {
        fed: GlobalFederateId,
        time: Time,
        iterate: IterationRequest,
        reply: Reply<TimeGrant>,
    },
    GetValue {
        fed: GlobalFederateId,
        input: InterfaceHandle,
        reply: oneshot::Sender<Option<SmallBuffer>>,
    },
    ReceiveMessage {
        fed: GlobalFederateId,
        endpoint: InterfaceHandle,
        reply: oneshot::Sender<Option<EndpointMessage>>,
    },
    Query {
        target: String,
        query: String,
        mode: QueryMode,
        reply: oneshot::Sender<String>,
    },
    Finalize {
        fed: GlobalFederateId,
        reply: Reply<()>,
    },
    Shutdown,
}

/// Comms-facing role object: pushes received commands into the kernel.
pub struct CoreRole {
    name: String,
    sender: mpsc::UnboundedSender<CoreEvent>,
}

impl KernelRole for CoreRole {
    fn queue_command(&self, cmd: ActionMessage) {
        let _ = self.sender.send(CoreEvent::Command(cmd));
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Handle to a running core kernel.
pub struct Core {
    name: String,
    sender: mpsc::UnboundedSender<CoreEvent>,
    role: Arc<CoreRole>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl Core {
    pub fn new(config: CoreConfig) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let role =
            Arc::new(CoreRole { name: config.name.clone(), sender: sender.clone() });
        let name = config.name.clone();
        let (state, timing_rx) = CoreState::new(config);
        let task = tokio::spawn(state.run(receiver, timing_rx));
        Core { name, sender, role, task: Some(task) }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> Arc<CoreRole> {
        self.role.clone()
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> ApiRequest,
    ) -> Result<T, KernelError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(CoreEvent::Api(build(tx)))
            .map_err(|_| KernelError::SystemFailure("core has shut down".into()))?;
        rx.await.map_err(|_| KernelError::SystemFailure("core dropped the request".into()))?
    }

    /// Attach the parent-broker transmit path and start registration with
    /// the broker. `advertised_address` is what peers use to route back.
    pub async fn attach_parent(
        &self,
        transmit: impl Fn(ActionMessage) + Send + 'static,
        advertised_address: &str,
    ) -> Result<(), KernelError> {
        let advertised_address = advertised_address.to_string();
        self.request(move |reply| ApiRequest::AttachParent {
            transmit: Box::new(transmit),
            advertised_address,
            reply,
        })
        .await
    }

    pub async fn register_federate(
        &self,
        name: &str,
        config: FederateTimingConfig,
    ) -> Result<Federate, KernelError> {
        let fed_name = name.to_string();
        let id = self
            .request(move |reply| ApiRequest::RegisterFederate { name: fed_name, config, reply })
            .await?;
        Ok(Federate { id, name: name.to_string(), api: self.sender.clone() })
    }

    pub async fn query(&self, target: &str, query: &str, mode: QueryMode) -> String {
        let (tx, rx) = oneshot::channel();
        let request = ApiRequest::Query {
            target: target.to_string(),
            query: query.to_string(),
            mode,
            reply: tx,
        };
        if self.sender.send(CoreEvent::Api(request)).is_err() {
            return query::error_body(500, "core has shut down");
        }
        rx.await.unwrap_or_else(|_| query::error_body(500, "core dropped the query"))
    }

    pub async fn shutdown(&mut self) {
        let _ = self.sender.send(CoreEvent::Api(ApiRequest::Shutdown));
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

/// Federate-facing client handle onto a core.
#[derive(Clone)]
pub struct Federate {
    id: GlobalFederateId,
    name: String,
    api: mpsc::UnboundedSender<CoreEvent>,
}

impl Federate {
    pub fn id(&self) -> GlobalFederateId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> ApiRequest,
    ) -> Result<T, KernelError> {
        let (tx, rx) = oneshot::channel();
        self.api
            .send(CoreEvent::Api(build(tx)))
            .map_err(|_| KernelError::SystemFailure("core has shut down".into()))?;
        rx.await.map_err(|_| KernelError::SystemFailure("core dropped the request".into()))?
    }

    pub async fn register_publication(
        &self,
        key: &str,
        data_type: &str,
        units: &str,
    ) -> Result<InterfaceHandle, KernelError> {
        let (key, data_type, units) =
            (key.to_string(), data_type.to_string(), units.to_string());
        let fed = self.id;
        self.request(move |reply| ApiRequest::RegisterPublication {
            fed,
            key,
            data_type,
            units,
            reply,
        })
        .await
    }

    pub async fn register_input(&self, name: &str) -> Result<InterfaceHandle, KernelError> {
        let name = name.to_string();
        let fed = self.id;
        self.request(move |reply| ApiRequest::RegisterInput { fed, name, reply }).await
    }

    pub async fn add_subscription(
        &self,
        input: InterfaceHandle,
        pub_key: &str,
    ) -> Result<(), KernelError> {
        let pub_key = pub_key.to_string();
        let fed = self.id;
        self.request(move |reply| ApiRequest::AddSubscription { fed, input, pub_key, reply })
            .await
    }

    pub async fn register_endpoint(&self, name: &str) -> Result<InterfaceHandle, KernelError> {
        let name = name.to_string();
        let fed = self.id;
        self.request(move |reply| ApiRequest::RegisterEndpoint { fed, name, reply }).await
    }

    pub async fn add_endpoint_link(&self, source: &str, dest: &str) -> Result<(), KernelError> {
        let (source, dest) = (source.to_string(), dest.to_string());
        self.request(move |reply| ApiRequest::AddEndpointLink { source, dest, reply }).await
    }

    pub async fn register_filter(
        &self,
        name: &str,
        placement: FilterPlacement,
        target_endpoint: &str,
    ) -> Result<GlobalHandle, KernelError> {
        let (name, target_endpoint) = (name.to_string(), target_endpoint.to_string());
        let fed = self.id;
        self.request(move |reply| ApiRequest::RegisterFilter {
            fed,
            name,
            placement,
            target_endpoint,
            reply,
        })
        .await
    }

    pub async fn set_filter_operator(
        &self,
        handle: GlobalHandle,
        operator: FilterOperator,
    ) -> Result<(), KernelError> {
        self.request(move |reply| ApiRequest::SetFilterOperator { handle, operator, reply })
            .await
    }

    /// Register a translator; returns the handle of its endpoint (message)
    /// side. The value side publishes under `<name>` and subscribes like an
    /// input.
    pub async fn register_translator(
        &self,
        name: &str,
        operator: TranslatorOperator,
    ) -> Result<InterfaceHandle, KernelError> {
        let name = name.to_string();
        let fed = self.id;
        self.request(move |reply| ApiRequest::RegisterTranslator { fed, name, operator, reply })
            .await
    }

    pub async fn publish(
        &self,
        handle: InterfaceHandle,
        data: impl Into<SmallBuffer>,
    ) -> Result<(), KernelError> {
        let data = data.into();
        let fed = self.id;
        self.request(move |reply| ApiRequest::Publish { fed, handle, data, reply }).await
    }

    pub async fn send_message(
        &self,
        endpoint: InterfaceHandle,
        dest: &str,
        data: impl Into<SmallBuffer>,
    ) -> Result<(), KernelError> {
        let dest = dest.to_string();
        let data = data.into();
        let fed = self.id;
        self.request(move |reply| ApiRequest::SendMessage { fed, endpoint, dest, data, reply })
            .await
    }

    pub async fn enter_initializing(&self) -> Result<(), KernelError> {
        let fed = self.id;
        self.request(move |reply| ApiRequest::EnterInitializing { fed, reply }).await
    }

    pub async fn enter_executing(
        &self,
        iterate: IterationRequest,
    ) -> Result<IterationState, KernelError> {
        let fed = self.id;
        self.request(move |reply| ApiRequest::EnterExecuting { fed, iterate, reply }).await
    }

    pub async fn request_time(
        &self,
        time: Time,
        iterate: IterationRequest,
    ) -> Result<TimeGrant, KernelError> {
        let fed = self.id;
        self.request(move |reply| ApiRequest::RequestTime { fed, time, iterate, reply }).await
    }

    pub async fn get_value(&self, input: InterfaceHandle) -> Option<SmallBuffer> {
        let (tx, rx) = oneshot::channel();
        let fed = self.id;
        if self
            .api
            .send(CoreEvent::Api(ApiRequest::GetValue { fed, input, reply: tx }))
            .is_err()
        {
            return None;
        }
        rx.await.unwrap_or(None)
    }

    pub async fn receive_message(&self, endpoint: InterfaceHandle) -> Option<EndpointMessage> {
        let (tx, rx) = oneshot::channel();
        let fed = self.id;
        if self
            .api
            .send(CoreEvent::Api(ApiRequest::ReceiveMessage { fed, endpoint, reply: tx }))
            .is_err()
        {
            return None;
        }
        rx.await.unwrap_or(None)
    }

    pub async fn query(&self, target: &str, query: &str, mode: QueryMode) -> String {
        let (tx, rx) = oneshot::channel();
        let request = ApiRequest::Query {
            target: target.to_string(),
            query: query.to_string(),
            mode,
            reply: tx,
        };
        if self.api.send(CoreEvent::Api(request)).is_err() {
            return query::error_body(500, "core has shut down");
        }
        rx.await.unwrap_or_else(|_| query::error_body(500, "core dropped the query"))
    }

    pub async fn finalize(&self) -> Result<(), KernelError> {
        let fed = self.id;
        self.request(move |reply| ApiRequest::Finalize { fed, reply }).await
    }
}

// --- kernel internals ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FedLifecycle {
    Created,
    Initializing,
    Executing,
    Finished,
}

struct InputState {
    name: String,
    value: Option<SmallBuffer>,
    pending: VecDeque<(Time, SmallBuffer)>,
    updated: bool,
    /// Translator input sides convert instead of storing.
    translator: Option<InterfaceHandle>,
}

struct PublicationState {
    key: String,
    data_type: String,
    units: String,
    subscribers: Vec<GlobalHandle>,
    last_value: Option<SmallBuffer>,
}

struct EndpointState {
    name: String,
    inbox: VecDeque<EndpointMessage>,
    pending: Vec<EndpointMessage>,
    /// Translator endpoint sides convert instead of queueing.
    translator: Option<InterfaceHandle>,
}

struct TranslatorState {
    operator: TranslatorOperator,
    publication: InterfaceHandle,
}

struct FederateState {
    id: GlobalFederateId,
    name: String,
    lifecycle: FedLifecycle,
    coordinator: TimeCoordinator,
    config: FederateTimingConfig,
    inputs: HashMap<InterfaceHandle, InputState>,
    publications: HashMap<InterfaceHandle, PublicationState>,
    endpoints: HashMap<InterfaceHandle, EndpointState>,
    translators: HashMap<InterfaceHandle, TranslatorState>,
    next_handle: i32,
    pending_init: Option<Reply<()>>,
    pending_exec: Option<Reply<IterationState>>,
    pending_time: Option<Reply<TimeGrant>>,
    delayed: VecDeque<ActionMessage>,
}

impl FederateState {
    fn allocate_handle(&mut self) -> InterfaceHandle {
        let handle = InterfaceHandle(self.next_handle);
        self.next_handle += 1;
        handle
    }

    /// Earliest pending value-update time across inputs.
    fn next_value_time(&self) -> Time {
        self.inputs
            .values()
            .flat_map(|input| input.pending.iter().map(|(t, _)| *t))
            .min()
            .unwrap_or(Time::MAXTIME)
    }

    /// Earliest pending message-arrival time across endpoints.
    fn next_message_time(&self) -> Time {
        self.endpoints
            .values()
            .flat_map(|endpoint| endpoint.pending.iter().map(|m| m.time))
            .min()
            .unwrap_or(Time::MAXTIME)
    }
}

struct CoreState {
    name: String,
    standalone: bool,
    global_id: GlobalFederateId,
    advertised_address: String,
    parent: Option<TransmitFn>,
    registered_with_parent: bool,
    timing_tx: mpsc::UnboundedSender<ActionMessage>,
    federates: HashMap<GlobalFederateId, FederateState>,
    fed_by_name: HashMap<String, GlobalFederateId>,
    pending_fed_regs: HashMap<String, (FederateTimingConfig, Reply<GlobalFederateId>)>,
    queued_fed_regs: Vec<ActionMessage>,
    /// Local publications by key.
    pub_by_key: HashMap<String, GlobalHandle>,
    /// Local inputs by name.
    input_by_name: HashMap<String, GlobalHandle>,
    /// Local endpoints by name.
    endpoint_by_name: HashMap<String, GlobalHandle>,
    /// Declared endpoint links: source name to destination names.
    endpoint_links: HashMap<String, Vec<String>>,
    filters: FilterRegistry,
    pending_queries: HashMap<i32, oneshot::Sender<String>>,
    next_query_id: i32,
    next_local_fed: i32,
    init_granted: bool,
    shutting_down: bool,
}

impl CoreState {
    fn new(config: CoreConfig) -> (Self, mpsc::UnboundedReceiver<ActionMessage>) {
        let (timing_tx, timing_rx) = mpsc::unbounded_channel();
        let state = CoreState {
            name: config.name.clone(),
            standalone: config.standalone,
            global_id: if config.standalone {
                GlobalFederateId::ROOT_BROKER
            } else {
                GlobalFederateId::INVALID
            },
            advertised_address: config.name,
            parent: None,
            registered_with_parent: false,
            timing_tx,
            federates: HashMap::new(),
            fed_by_name: HashMap::new(),
            pending_fed_regs: HashMap::new(),
            queued_fed_regs: Vec::new(),
            pub_by_key: HashMap::new(),
            input_by_name: HashMap::new(),
            endpoint_by_name: HashMap::new(),
            endpoint_links: HashMap::new(),
            filters: FilterRegistry::default(),
            pending_queries: HashMap::new(),
            next_query_id: 1,
            next_local_fed: 0,
            init_granted: false,
            shutting_down: false,
        };
        (state, timing_rx)
    }

    async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<CoreEvent>,
        mut timing_rx: mpsc::UnboundedReceiver<ActionMessage>,
    ) {
        tracing::info!(core = %self.name, "core kernel started");
        loop {
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Some(CoreEvent::Command(cmd)) => self.process_command(cmd),
                        Some(CoreEvent::Api(request)) => self.process_api(request),
                        None => break,
                    }
                }
                outbound = timing_rx.recv() => {
                    if let Some(cmd) = outbound {
                        self.route_command(cmd);
                    }
                }
            }
            if self.shutting_down {
                break;
            }
        }
        tracing::info!(core = %self.name, "core kernel stopped");
    }

    fn transmit_parent(&self, cmd: ActionMessage) {
        match &self.parent {
            Some(transmit) => transmit(cmd),
            None => {
                if !cmd.is_ignoreable_command() {
                    tracing::warn!(core = %self.name, "no parent route for {cmd}");
                }
            }
        }
    }

    /// Send a command toward its destination: local federate or upward.
    fn route_command(&mut self, cmd: ActionMessage) {
        if self.federates.contains_key(&cmd.dest_id) {
            self.process_fed_command(cmd.dest_id, cmd);
        } else {
            self.transmit_parent(cmd);
        }
    }

    fn make_coordinator(
        &self,
        id: GlobalFederateId,
        config: &FederateTimingConfig,
    ) -> TimeCoordinator {
        let timing = self.timing_tx.clone();
        TimeCoordinator::new(id, config.clone(), move |msg| {
            let _ = timing.send(msg);
        })
    }

    fn insert_federate(
        &mut self,
        id: GlobalFederateId,
        name: String,
        config: FederateTimingConfig,
    ) {
        let coordinator = self.make_coordinator(id, &config);
        self.fed_by_name.insert(name.clone(), id);
        self.federates.insert(
            id,
            FederateState {
                id,
                name,
                lifecycle: FedLifecycle::Created,
                coordinator,
                config,
                inputs: HashMap::new(),
                publications: HashMap::new(),
                endpoints: HashMap::new(),
                translators: HashMap::new(),
                next_handle: 0,
                pending_init: None,
                pending_exec: None,
                pending_time: None,
                delayed: VecDeque::new(),
            },
        );
    }

    // --- API handling ---

    fn process_api(&mut self, request: ApiRequest) {
        match request {
            ApiRequest::AttachParent { transmit, advertised_address, reply } => {
                if self.standalone {
                    let _ = reply.send(Err(KernelError::InvalidFunctionCall(
                        "standalone cores have no parent",
                    )));
                    return;
                }
                self.parent = Some(transmit);
                self.advertised_address = advertised_address;
                let mut reg = ActionMessage::new(Action::RegBroker);
                reg.name = self.name.clone();
                reg.payload = self.advertised_address.as_str().into();
                self.transmit_parent(reg);
                let _ = reply.send(Ok(()));
            }
            ApiRequest::RegisterFederate { name, config, reply } => {
                self.register_federate(name, config, reply);
            }
            ApiRequest::RegisterPublication { fed, key, data_type, units, reply } => {
                let _ = reply.send(self.register_publication(fed, key, data_type, units));
            }
            ApiRequest::RegisterInput { fed, name, reply } => {
                let _ = reply.send(self.register_input(fed, name));
            }
            ApiRequest::AddSubscription { fed, input, pub_key, reply } => {
                let _ = reply.send(self.add_subscription(fed, input, pub_key));
            }
            ApiRequest::RegisterEndpoint { fed, name, reply } => {
                let _ = reply.send(self.register_endpoint(fed, name));
            }
            ApiRequest::AddEndpointLink { source, dest, reply } => {
                let _ = reply.send(self.add_endpoint_link(&source, &dest));
            }
            ApiRequest::RegisterFilter { fed, name, placement, target_endpoint, reply } => {
                let _ =
                    reply.send(self.register_filter(fed, name, placement, target_endpoint));
            }
            ApiRequest::SetFilterOperator { handle, operator, reply } => {
                let result = if self.filters.set_operator(handle, operator) {
                    Ok(())
                } else {
                    Err(KernelError::InvalidIdentifier(format!("no filter {handle:?}")))
                };
                let _ = reply.send(result);
            }
            ApiRequest::RegisterTranslator { fed, name, operator, reply } => {
                let _ = reply.send(self.register_translator(fed, name, operator));
            }
            ApiRequest::Publish { fed, handle, data, reply } => {
                let _ = reply.send(self.publish(fed, handle, data));
            }
            ApiRequest::SendMessage { fed, endpoint, dest, data, reply } => {
                let _ = reply.send(self.send_message(fed, endpoint, dest, data));
            }
            ApiRequest::EnterInitializing { fed, reply } => {
                self.enter_initializing(fed, reply);
            }
            ApiRequest::EnterExecuting { fed, iterate, reply } => {
                self.enter_executing(fed, iterate, reply);
            }
            ApiRequest::RequestTime { fed, time, iterate, reply } => {
                self.request_time(fed, time, iterate, reply);
            }
            ApiRequest::GetValue { fed, input, reply } => {
                let value = self
                    .federates
                    .get(&fed)
                    .and_then(|f| f.inputs.get(&input))
                    .and_then(|i| i.value.clone());
                let _ = reply.send(value);
            }
            ApiRequest::ReceiveMessage { fed, endpoint, reply } => {
                let msg = self
                    .federates
                    .get_mut(&fed)
                    .and_then(|f| f.endpoints.get_mut(&endpoint))
                    .and_then(|e| e.inbox.pop_front());
                let _ = reply.send(msg);
            }
            ApiRequest::Query { target, query, mode, reply } => {
                self.handle_query(target, query, mode, reply);
            }
            ApiRequest::Finalize { fed, reply } => {
                let _ = reply.send(self.finalize(fed));
            }
            ApiRequest::Shutdown => {
                self.shutting_down = true;
            }
        }
    }

    fn register_federate(
        &mut self,
        name: String,
        config: FederateTimingConfig,
        reply: Reply<GlobalFederateId>,
    ) {
        if self.fed_by_name.contains_key(&name) || self.pending_fed_regs.contains_key(&name) {
            let _ = reply.send(Err(KernelError::RegistrationFailure(format!(
                "federate '{name}' already registered"
            ))));
            return;
        }
        if self.standalone {
            let id = GlobalFederateId::new_federate(self.next_local_fed);
            self.next_local_fed += 1;
            self.insert_federate(id, name, config);
            let _ = reply.send(Ok(id));
        } else {
            let mut reg = ActionMessage::new(Action::RegFed);
            reg.name = name.clone();
            reg.source_id = self.global_id;
            self.pending_fed_regs.insert(name, (config, reply));
            if self.registered_with_parent {
                self.transmit_parent(reg);
            } else {
                // held until the broker acknowledges this core
                self.queued_fed_regs.push(reg);
            }
        }
    }

    fn register_publication(
        &mut self,
        fed: GlobalFederateId,
        key: String,
        data_type: String,
        units: String,
    ) -> Result<InterfaceHandle, KernelError> {
        if self.pub_by_key.contains_key(&key) {
            return Err(KernelError::RegistrationFailure(format!(
                "publication '{key}' already registered"
            )));
        }
        let standalone = self.standalone;
        let federate = self
            .federates
            .get_mut(&fed)
            .ok_or_else(|| KernelError::InvalidIdentifier(format!("{fed}")))?;
        let handle = federate.allocate_handle();
        federate.publications.insert(
            handle,
            PublicationState {
                key: key.clone(),
                data_type: data_type.clone(),
                units: units.clone(),
                subscribers: Vec::new(),
                last_value: None,
            },
        );
        self.pub_by_key.insert(key.clone(), GlobalHandle::new(fed, handle));
        if !standalone {
            let mut reg = ActionMessage::new(Action::RegPub);
            reg.source_id = fed;
            reg.source_handle = handle;
            reg.name = key;
            reg.string_data = vec![data_type, units];
            self.transmit_parent(reg);
        }
        Ok(handle)
    }

    fn register_input(
        &mut self,
        fed: GlobalFederateId,
        name: String,
    ) -> Result<InterfaceHandle, KernelError> {
        if self.input_by_name.contains_key(&name) {
            return Err(KernelError::RegistrationFailure(format!(
                "input '{name}' already registered"
            )));
        }
        let federate = self
            .federates
            .get_mut(&fed)
            .ok_or_else(|| KernelError::InvalidIdentifier(format!("{fed}")))?;
        let handle = federate.allocate_handle();
        federate.inputs.insert(
            handle,
            InputState {
                name: name.clone(),
                value: None,
                pending: VecDeque::new(),
                updated: false,
                translator: None,
            },
        );
        self.input_by_name.insert(name, GlobalHandle::new(fed, handle));
        Ok(handle)
    }

    fn add_subscription(
        &mut self,
        fed: GlobalFederateId,
        input: InterfaceHandle,
        pub_key: String,
    ) -> Result<(), KernelError> {
        if !self
            .federates
            .get(&fed)
            .map(|f| f.inputs.contains_key(&input))
            .unwrap_or(false)
        {
            return Err(KernelError::InvalidIdentifier(format!("{fed} input {input:?}")));
        }
        match self.pub_by_key.get(&pub_key).copied() {
            Some(publisher) => {
                self.link_pub_to_input(publisher, GlobalHandle::new(fed, input));
                Ok(())
            }
            None if !self.standalone => {
                // ask the broker to match it federation-wide
                let mut req = ActionMessage::new(Action::RegInput);
                req.source_id = fed;
                req.source_handle = input;
                req.name = pub_key;
                self.transmit_parent(req);
                Ok(())
            }
            None => Err(KernelError::InvalidIdentifier(format!(
                "publication '{pub_key}' is not registered"
            ))),
        }
    }

    /// Connect a local publication to a local input, wiring the timing
    /// dependency both ways.
    fn link_pub_to_input(&mut self, publisher: GlobalHandle, subscriber: GlobalHandle) {
        if let Some(federate) = self.federates.get_mut(&publisher.fed) {
            if let Some(publication) = federate.publications.get_mut(&publisher.handle) {
                if !publication.subscribers.contains(&subscriber) {
                    publication.subscribers.push(subscriber);
                }
            }
            if publisher.fed != subscriber.fed {
                federate.coordinator.add_dependent(subscriber.fed);
            }
        }
        if publisher.fed != subscriber.fed {
            if let Some(federate) = self.federates.get_mut(&subscriber.fed) {
                federate.coordinator.add_dependency(publisher.fed);
            }
        }
    }

    fn register_endpoint(
        &mut self,
        fed: GlobalFederateId,
        name: String,
    ) -> Result<InterfaceHandle, KernelError> {
        if self.endpoint_by_name.contains_key(&name) {
            return Err(KernelError::RegistrationFailure(format!(
                "endpoint '{name}' already registered"
            )));
        }
        let standalone = self.standalone;
        let federate = self
            .federates
            .get_mut(&fed)
            .ok_or_else(|| KernelError::InvalidIdentifier(format!("{fed}")))?;
        let handle = federate.allocate_handle();
        federate.endpoints.insert(
            handle,
            EndpointState {
                name: name.clone(),
                inbox: VecDeque::new(),
                pending: Vec::new(),
                translator: None,
            },
        );
        self.endpoint_by_name.insert(name.clone(), GlobalHandle::new(fed, handle));
        if !standalone {
            let mut reg = ActionMessage::new(Action::RegEndpoint);
            reg.source_id = fed;
            reg.source_handle = handle;
            reg.name = name;
            self.transmit_parent(reg);
        }
        Ok(handle)
    }

    fn add_endpoint_link(&mut self, source: &str, dest: &str) -> Result<(), KernelError> {
        let targets = self.endpoint_links.entry(source.to_string()).or_default();
        if !targets.contains(&dest.to_string()) {
            targets.push(dest.to_string());
        }
        let source_owner = self.endpoint_by_name.get(source).copied();
        let dest_owner = self.endpoint_by_name.get(dest).copied();
        match (source_owner, dest_owner) {
            (Some(src), Some(dst)) => {
                if src.fed != dst.fed {
                    if let Some(fed) = self.federates.get_mut(&src.fed) {
                        fed.coordinator.add_dependent(dst.fed);
                    }
                    if let Some(fed) = self.federates.get_mut(&dst.fed) {
                        fed.coordinator.add_dependency(src.fed);
                    }
                }
                Ok(())
            }
            _ if !self.standalone => {
                let mut link = ActionMessage::new(Action::AddEndpointLink);
                link.name = source.to_string();
                link.string_data = vec![dest.to_string()];
                self.transmit_parent(link);
                Ok(())
            }
            _ => Err(KernelError::InvalidIdentifier(format!(
                "endpoint link {source} -> {dest} has an unknown endpoint"
            ))),
        }
    }

    fn register_filter(
        &mut self,
        fed: GlobalFederateId,
        name: String,
        placement: FilterPlacement,
        target_endpoint: String,
    ) -> Result<GlobalHandle, KernelError> {
        let federate = self
            .federates
            .get_mut(&fed)
            .ok_or_else(|| KernelError::InvalidIdentifier(format!("{fed}")))?;
        let handle = GlobalHandle::new(fed, federate.allocate_handle());
        self.filters.register(handle, &name, placement, &target_endpoint);
        Ok(handle)
    }

    /// A translator registers three faces under one returned handle: the
    /// endpoint (message side) at `<name>.msg`, a publication under `name`,
    /// and an input (value side) at `<name>.value` that can be subscribed
    /// like any other input.
    fn register_translator(
        &mut self,
        fed: GlobalFederateId,
        name: String,
        operator: TranslatorOperator,
    ) -> Result<InterfaceHandle, KernelError> {
        let input_name = format!("{name}.value");
        if self.input_by_name.contains_key(&input_name) {
            return Err(KernelError::RegistrationFailure(format!(
                "input '{input_name}' already registered"
            )));
        }
        let endpoint = self.register_endpoint(fed, format!("{name}.msg"))?;
        let publication =
            self.register_publication(fed, name.clone(), "translated".into(), String::new())?;
        let federate = self.federates.get_mut(&fed).expect("federate just used");
        if let Some(endpoint_state) = federate.endpoints.get_mut(&endpoint) {
            endpoint_state.translator = Some(endpoint);
        }
        federate.inputs.insert(
            endpoint,
            InputState {
                name: input_name.clone(),
                value: None,
                pending: VecDeque::new(),
                updated: false,
                translator: Some(endpoint),
            },
        );
        self.input_by_name.insert(input_name, GlobalHandle::new(fed, endpoint));
        federate.translators.insert(endpoint, TranslatorState { operator, publication });
        Ok(endpoint)
    }

    fn publish(
        &mut self,
        fed: GlobalFederateId,
        handle: InterfaceHandle,
        data: SmallBuffer,
    ) -> Result<(), KernelError> {
        let federate = self
            .federates
            .get_mut(&fed)
            .ok_or_else(|| KernelError::InvalidIdentifier(format!("{fed}")))?;
        let publication = federate
            .publications
            .get_mut(&handle)
            .ok_or_else(|| KernelError::InvalidIdentifier(format!("publication {handle:?}")))?;
        if federate.config.only_transmit_on_change
            && publication.last_value.as_ref() == Some(&data)
        {
            return Ok(());
        }
        publication.last_value = Some(data.clone());
        let subscribers = publication.subscribers.clone();
        // before execution mode the update registers as an init-time event
        let time = if federate.coordinator.in_execution_mode() {
            federate.coordinator.granted_time()
        } else {
            Time::from_ns(-1)
        };
        let source_handle = handle;
        for subscriber in subscribers {
            if self.federates.contains_key(&subscriber.fed) {
                self.deliver_value(subscriber, data.clone(), time);
                self.advance_federate(subscriber.fed);
            } else {
                let mut cmd = ActionMessage::new(Action::Publish);
                cmd.source_id = fed;
                cmd.source_handle = source_handle;
                cmd.dest_id = subscriber.fed;
                cmd.dest_handle = subscriber.handle;
                cmd.action_time = time;
                cmd.payload = data.clone();
                self.transmit_parent(cmd);
            }
        }
        Ok(())
    }

    fn deliver_value(&mut self, target: GlobalHandle, data: SmallBuffer, time: Time) {
        let mut translated: Option<EndpointMessage> = None;
        {
            let Some(federate) = self.federates.get_mut(&target.fed) else { return };
            let translator_handle =
                federate.inputs.get(&target.handle).and_then(|i| i.translator);
            match translator_handle {
                Some(handle) => {
                    // value side of a translator: convert and send onward
                    if let Some(translator) = federate.translators.get_mut(&handle) {
                        let body = translator.operator.value_to_message(data.as_bytes());
                        let endpoint_name = federate
                            .endpoints
                            .get(&handle)
                            .map(|e| e.name.clone())
                            .unwrap_or_default();
                        translated = Some(EndpointMessage::new(&endpoint_name, "", time, body));
                    }
                }
                None => {
                    // an arrival at or before the current instant is part of
                    // it; only future arrivals become timing events
                    let visible_now = federate.coordinator.in_execution_mode()
                        && time + federate.config.input_delay
                            <= federate.coordinator.granted_time();
                    let only_on_change = federate.config.only_update_on_change;
                    let Some(input) = federate.inputs.get_mut(&target.handle) else { return };
                    if visible_now {
                        if !(only_on_change && input.value.as_ref() == Some(&data)) {
                            input.value = Some(data);
                            input.updated = true;
                        }
                    } else {
                        input.pending.push_back((time, data));
                        federate.coordinator.update_value_time(time);
                    }
                }
            }
        }
        if let Some(msg) = translated {
            self.route_translator_output(msg);
        }
    }

    /// Translated messages fan out along declared endpoint links.
    fn route_translator_output(&mut self, msg: EndpointMessage) {
        let dests = self.endpoint_links.get(&msg.source).cloned().unwrap_or_default();
        if dests.is_empty() {
            tracing::debug!(source = %msg.source, "translator output has no linked endpoints");
            return;
        }
        for dest in dests {
            let mut out = msg.clone();
            out.dest = dest.clone();
            out.original_dest = dest;
            let source = out.source.clone();
            for filtered in self.filters.apply_source(&source, out) {
                self.route_endpoint_message(filtered);
            }
        }
    }

    fn send_message(
        &mut self,
        fed: GlobalFederateId,
        endpoint: InterfaceHandle,
        dest: String,
        data: SmallBuffer,
    ) -> Result<(), KernelError> {
        let federate = self
            .federates
            .get_mut(&fed)
            .ok_or_else(|| KernelError::InvalidIdentifier(format!("{fed}")))?;
        let source_name = federate
            .endpoints
            .get(&endpoint)
            .map(|e| e.name.clone())
            .ok_or_else(|| KernelError::InvalidIdentifier(format!("endpoint {endpoint:?}")))?;
        let time = if federate.coordinator.in_execution_mode() {
            federate.coordinator.granted_time()
        } else {
            Time::from_ns(-1)
        };
        let msg = EndpointMessage::new(&source_name, &dest, time, data);
        let outs = self.filters.apply_source(&source_name, msg);
        for out in outs {
            self.route_endpoint_message(out);
        }
        Ok(())
    }

    fn route_endpoint_message(&mut self, msg: EndpointMessage) {
        match self.endpoint_by_name.get(&msg.dest).copied() {
            Some(target) if self.federates.contains_key(&target.fed) => {
                self.deliver_message(target, msg);
            }
            _ if !self.standalone => {
                let mut cmd = ActionMessage::new(Action::SendMessage);
                cmd.action_time = msg.time;
                cmd.payload = msg.payload.clone();
                cmd.name = msg.dest.clone();
                cmd.string_data =
                    vec![msg.source.clone(), msg.original_source.clone(), msg.original_dest];
                self.transmit_parent(cmd);
            }
            _ => {
                tracing::warn!(dest = %msg.dest, "dropping message to unknown endpoint");
            }
        }
    }

    fn deliver_message(&mut self, target: GlobalHandle, msg: EndpointMessage) {
        let dest_name = msg.dest.clone();
        let outs = self.filters.apply_destination(&dest_name, msg);
        let mut to_publish: Vec<(InterfaceHandle, SmallBuffer)> = Vec::new();
        {
            let Some(federate) = self.federates.get_mut(&target.fed) else { return };
            let translator_handle =
                federate.endpoints.get(&target.handle).and_then(|e| e.translator);
            for out in outs {
                if let Some(handle) = translator_handle {
                    // message side of a translator: convert and publish
                    if let Some(translator) = federate.translators.get_mut(&handle) {
                        let value = translator.operator.message_to_value(&out);
                        to_publish.push((translator.publication, value));
                        continue;
                    }
                }
                let time = out.time;
                let visible_now = federate.coordinator.in_execution_mode()
                    && time + federate.config.input_delay
                        <= federate.coordinator.granted_time();
                if let Some(endpoint) = federate.endpoints.get_mut(&target.handle) {
                    if visible_now {
                        endpoint.inbox.push_back(out);
                    } else {
                        endpoint.pending.push(out);
                        federate.coordinator.update_message_time(time);
                    }
                }
            }
        }
        for (publication, value) in to_publish {
            if let Err(err) = self.publish(target.fed, publication, value) {
                tracing::error!("translator publish failed: {err}");
            }
        }
    }

    // --- lifecycle ---

    fn enter_initializing(&mut self, fed: GlobalFederateId, reply: Reply<()>) {
        let standalone = self.standalone;
        let Some(federate) = self.federates.get_mut(&fed) else {
            let _ = reply.send(Err(KernelError::InvalidIdentifier(format!("{fed}"))));
            return;
        };
        if federate.lifecycle != FedLifecycle::Created {
            let _ = reply.send(Err(KernelError::InvalidFunctionCall(
                "federate is past the created state",
            )));
            return;
        }
        if standalone || self.init_granted {
            federate.lifecycle = FedLifecycle::Initializing;
            let _ = reply.send(Ok(()));
        } else {
            federate.pending_init = Some(reply);
            let mut init = ActionMessage::new(Action::Init);
            init.source_id = fed;
            self.transmit_parent(init);
        }
    }

    fn enter_executing(
        &mut self,
        fed: GlobalFederateId,
        iterate: IterationRequest,
        reply: Reply<IterationState>,
    ) {
        let Some(federate) = self.federates.get_mut(&fed) else {
            let _ = reply.send(Err(KernelError::InvalidIdentifier(format!("{fed}"))));
            return;
        };
        federate.lifecycle = FedLifecycle::Initializing;
        federate.pending_exec = Some(reply);
        federate.coordinator.entering_exec_mode(iterate);
        self.advance_federate(fed);
    }

    fn request_time(
        &mut self,
        fed: GlobalFederateId,
        time: Time,
        iterate: IterationRequest,
        reply: Reply<TimeGrant>,
    ) {
        let Some(federate) = self.federates.get_mut(&fed) else {
            let _ = reply.send(Err(KernelError::InvalidIdentifier(format!("{fed}"))));
            return;
        };
        if federate.lifecycle != FedLifecycle::Executing {
            let _ = reply.send(Err(KernelError::InvalidFunctionCall(
                "time requests require execution mode",
            )));
            return;
        }
        let value_time = federate.next_value_time();
        let message_time = federate.next_message_time();
        federate.pending_time = Some(reply);
        federate.coordinator.time_request(time, iterate, value_time, message_time);
        self.advance_federate(fed);
    }

    fn finalize(&mut self, fed: GlobalFederateId) -> Result<(), KernelError> {
        let federate = self
            .federates
            .get_mut(&fed)
            .ok_or_else(|| KernelError::InvalidIdentifier(format!("{fed}")))?;
        tracing::info!(fed = %federate.id, name = %federate.name, "federate finalized");
        federate.coordinator.disconnect();
        federate.lifecycle = FedLifecycle::Finished;
        if !self.standalone
            && self.federates.values().all(|f| f.lifecycle == FedLifecycle::Finished)
        {
            let mut bye = ActionMessage::new(Action::Disconnect);
            bye.source_id = self.global_id;
            self.transmit_parent(bye);
        }
        Ok(())
    }

    /// Drive a federate's pending exec or time request toward completion.
    fn advance_federate(&mut self, fed: GlobalFederateId) {
        let Some(federate) = self.federates.get_mut(&fed) else { return };

        if federate.pending_exec.is_some() {
            match federate.coordinator.check_exec_entry() {
                IterationState::NextStep => {
                    federate.lifecycle = FedLifecycle::Executing;
                    if let Some(reply) = federate.pending_exec.take() {
                        let _ = reply.send(Ok(IterationState::NextStep));
                    }
                }
                IterationState::Iterating => {
                    if let Some(reply) = federate.pending_exec.take() {
                        let _ = reply.send(Ok(IterationState::Iterating));
                    }
                }
                IterationState::Halted => {
                    if let Some(reply) = federate.pending_exec.take() {
                        let _ = reply.send(Err(KernelError::SystemFailure(
                            "federation halted during exec entry".into(),
                        )));
                    }
                }
                IterationState::ContinueProcessing => {}
            }
        }

        if federate.pending_time.is_some() {
            let outcome = federate.coordinator.check_time_grant();
            match outcome {
                IterationState::NextStep | IterationState::Iterating => {
                    let granted = federate.coordinator.granted_time();
                    let grant = Self::collect_grant(federate, granted, outcome);
                    if let Some(reply) = federate.pending_time.take() {
                        let _ = reply.send(Ok(grant));
                    }
                    self.replay_delayed(fed);
                }
                IterationState::Halted => {
                    if let Some(reply) = federate.pending_time.take() {
                        let _ = reply.send(Ok(TimeGrant {
                            time: Time::MAXTIME,
                            state: IterationState::Halted,
                            updated_inputs: Vec::new(),
                        }));
                    }
                    self.replay_delayed(fed);
                }
                IterationState::ContinueProcessing => {}
            }
        }
    }

    /// Apply pending deliveries visible at the granted time and report
    /// which inputs changed.
    fn collect_grant(
        federate: &mut FederateState,
        granted: Time,
        state: IterationState,
    ) -> TimeGrant {
        let mut updated_inputs = Vec::new();
        let only_on_change = federate.config.only_update_on_change;
        for (handle, input) in federate.inputs.iter_mut() {
            // updates since the previous grant (immediate deliveries)
            let mut updated = std::mem::take(&mut input.updated);
            let mut latest: Option<SmallBuffer> = None;
            while input.pending.front().map(|(t, _)| *t <= granted).unwrap_or(false) {
                latest = input.pending.pop_front().map(|(_, data)| data);
            }
            if let Some(data) = latest {
                if !(only_on_change && input.value.as_ref() == Some(&data)) {
                    input.value = Some(data);
                    updated = true;
                }
            }
            if updated {
                updated_inputs.push(*handle);
            }
        }
        for endpoint in federate.endpoints.values_mut() {
            let mut remaining = Vec::new();
            for msg in endpoint.pending.drain(..) {
                if msg.time <= granted {
                    endpoint.inbox.push_back(msg);
                } else {
                    remaining.push(msg);
                }
            }
            endpoint.pending = remaining;
            endpoint.inbox.make_contiguous().sort_by_key(|m| m.time);
        }
        updated_inputs.sort();
        TimeGrant { time: granted, state, updated_inputs }
    }

    fn replay_delayed(&mut self, fed: GlobalFederateId) {
        let delayed = match self.federates.get_mut(&fed) {
            Some(federate) => std::mem::take(&mut federate.delayed),
            None => return,
        };
        for cmd in delayed {
            self.process_fed_command(fed, cmd);
        }
    }

    // --- inbound command handling ---

    fn process_command(&mut self, cmd: ActionMessage) {
        match cmd.action {
            Action::BrokerAck => {
                if cmd.has_flag(MessageFlags::ERROR) {
                    tracing::error!(core = %self.name, "broker rejected the core registration");
                    self.fail_all_pending();
                    return;
                }
                self.global_id = cmd.dest_id;
                self.registered_with_parent = true;
                tracing::info!(core = %self.name, id = %self.global_id, "core registered with broker");
                for reg in std::mem::take(&mut self.queued_fed_regs) {
                    let mut reg = reg;
                    reg.source_id = self.global_id;
                    self.transmit_parent(reg);
                }
            }
            Action::FedAck => {
                let name = cmd.name.clone();
                if let Some((config, reply)) = self.pending_fed_regs.remove(&name) {
                    if cmd.has_flag(MessageFlags::ERROR) {
                        let _ = reply.send(Err(KernelError::RegistrationFailure(format!(
                            "federate '{name}' was rejected by the broker"
                        ))));
                        return;
                    }
                    let id = cmd.dest_id;
                    self.insert_federate(id, name, config);
                    let _ = reply.send(Ok(id));
                }
            }
            Action::InitGrant => {
                self.init_granted = true;
                for federate in self.federates.values_mut() {
                    if let Some(reply) = federate.pending_init.take() {
                        federate.lifecycle = FedLifecycle::Initializing;
                        let _ = reply.send(Ok(()));
                    }
                }
            }
            Action::AddSubscriber => {
                // we own the publication; a remote input subscribes
                let publisher = GlobalHandle::new(cmd.dest_id, cmd.dest_handle);
                let subscriber = GlobalHandle::new(cmd.source_id, cmd.source_handle);
                if let Some(federate) = self.federates.get_mut(&publisher.fed) {
                    if let Some(publication) = federate.publications.get_mut(&publisher.handle) {
                        if !publication.subscribers.contains(&subscriber) {
                            publication.subscribers.push(subscriber);
                        }
                    }
                    federate.coordinator.add_dependent(subscriber.fed);
                }
            }
            Action::AddPublisher => {
                // we own the input; a remote publication feeds it
                let subscriber = GlobalHandle::new(cmd.dest_id, cmd.dest_handle);
                if let Some(federate) = self.federates.get_mut(&subscriber.fed) {
                    federate.coordinator.add_dependency(cmd.source_id);
                }
            }
            Action::Publish => {
                let target = GlobalHandle::new(cmd.dest_id, cmd.dest_handle);
                self.deliver_value(target, cmd.payload.clone(), cmd.action_time);
                self.advance_federate(target.fed);
            }
            Action::SendMessage => {
                let mut msg = EndpointMessage::new(
                    cmd.string_data.first().map(String::as_str).unwrap_or(""),
                    &cmd.name,
                    cmd.action_time,
                    cmd.payload.clone(),
                );
                if let Some(original_source) = cmd.string_data.get(1) {
                    msg.original_source = original_source.clone();
                }
                if let Some(original_dest) = cmd.string_data.get(2) {
                    msg.original_dest = original_dest.clone();
                }
                if let Some(target) = self.endpoint_by_name.get(&cmd.name).copied() {
                    self.deliver_message(target, msg);
                    self.advance_federate(target.fed);
                } else {
                    tracing::warn!(dest = %cmd.name, "message for unknown endpoint");
                }
            }
            Action::TimeRequest
            | Action::TimeGrant
            | Action::ExecRequest
            | Action::ExecGrant
            | Action::TimeBlock
            | Action::TimeUnblock
            | Action::Disconnect => {
                let fed = cmd.dest_id;
                self.process_fed_command(fed, cmd);
            }
            Action::AddDependency
            | Action::RemoveDependency
            | Action::AddDependent
            | Action::RemoveDependent
            | Action::AddInterdependency
            | Action::RemoveInterdependency => {
                if let Some(federate) = self.federates.get_mut(&cmd.dest_id) {
                    federate.coordinator.process_dependency_update(&cmd);
                }
            }
            Action::TimeConfigure => {
                if let Some(federate) = self.federates.get_mut(&cmd.dest_id) {
                    let init_mode = federate.lifecycle != FedLifecycle::Executing;
                    federate.coordinator.process_config_update(&cmd, init_mode);
                }
            }
            Action::Query | Action::OrderedQuery => {
                self.answer_remote_query(cmd);
            }
            Action::QueryReply | Action::OrderedQueryReply => {
                if let Some(reply) = self.pending_queries.remove(&cmd.message_id) {
                    let _ = reply.send(cmd.payload.to_string_lossy().into_owned());
                }
            }
            Action::GlobalError => {
                tracing::error!(
                    core = %self.name,
                    "global error {}: {}",
                    cmd.message_id,
                    cmd.payload.to_string_lossy()
                );
                self.fail_all_pending();
            }
            Action::Error => {
                tracing::error!(core = %self.name, "error from {}", cmd.source_id);
            }
            _ => {
                tracing::debug!(core = %self.name, "unhandled command {cmd}");
            }
        }
    }

    fn process_fed_command(&mut self, fed: GlobalFederateId, cmd: ActionMessage) {
        let Some(federate) = self.federates.get_mut(&fed) else { return };
        match federate.coordinator.process_time_message(&cmd) {
            TimeProcessResult::DelayProcessing => {
                federate.delayed.push_back(cmd);
            }
            TimeProcessResult::Processed | TimeProcessResult::NoEffect => {}
        }
        self.advance_federate(fed);
    }

    fn fail_all_pending(&mut self) {
        for federate in self.federates.values_mut() {
            if let Some(reply) = federate.pending_init.take() {
                let _ = reply.send(Err(KernelError::SystemFailure("federation error".into())));
            }
            if let Some(reply) = federate.pending_exec.take() {
                let _ = reply.send(Err(KernelError::SystemFailure("federation error".into())));
            }
            if let Some(reply) = federate.pending_time.take() {
                let _ = reply.send(Err(KernelError::SystemFailure("federation error".into())));
            }
        }
    }

    // --- queries ---

    fn handle_query(
        &mut self,
        target: String,
        query: String,
        mode: QueryMode,
        reply: oneshot::Sender<String>,
    ) {
        if target == "core" || target == self.name {
            let _ = reply.send(self.answer_local_query(&query));
            return;
        }
        if let Some(&fed) = self.fed_by_name.get(&target) {
            let _ = reply.send(self.answer_federate_query(fed, &query));
            return;
        }
        if self.parent.is_some() {
            let token = self.next_query_id;
            self.next_query_id += 1;
            self.pending_queries.insert(token, reply);
            let mut cmd = ActionMessage::new(match mode {
                QueryMode::Fast => Action::Query,
                QueryMode::Ordered => Action::OrderedQuery,
            });
            cmd.source_id = self.global_id;
            cmd.message_id = token;
            cmd.name = target;
            cmd.payload = query.as_str().into();
            self.transmit_parent(cmd);
        } else {
            let _ = reply.send(query::not_found(&target));
        }
    }

    fn answer_remote_query(&mut self, cmd: ActionMessage) {
        let target = cmd.name.clone();
        let body = if target == "core" || target == self.name {
            self.answer_local_query(&cmd.payload.to_string_lossy())
        } else if let Some(&fed) = self.fed_by_name.get(&target) {
            self.answer_federate_query(fed, &cmd.payload.to_string_lossy())
        } else {
            query::not_found(&target)
        };
        let mut response = ActionMessage::new(match cmd.action {
            Action::OrderedQuery => Action::OrderedQueryReply,
            _ => Action::QueryReply,
        });
        response.dest_id = cmd.source_id;
        response.message_id = cmd.message_id;
        response.payload = body.into();
        self.transmit_parent(response);
    }

    fn answer_local_query(&self, query: &str) -> String {
        match query {
            "name" => serde_json::json!(self.name).to_string(),
            "address" => serde_json::json!(self.advertised_address).to_string(),
            "isinit" => serde_json::json!(self
                .federates
                .values()
                .all(|f| f.lifecycle != FedLifecycle::Created))
            .to_string(),
            "federates" => {
                query::name_list(self.federates.values().map(|f| f.name.clone()))
            }
            "current_time" => {
                let times: HashMap<_, _> = self
                    .federates
                    .values()
                    .map(|f| (f.name.clone(), f.coordinator.granted_time().to_string()))
                    .collect();
                serde_json::json!(times).to_string()
            }
            "version" => serde_json::json!(env!("CARGO_PKG_VERSION")).to_string(),
            _ => query::unknown_query(query),
        }
    }

    fn answer_federate_query(&self, fed: GlobalFederateId, query: &str) -> String {
        let Some(federate) = self.federates.get(&fed) else {
            return query::not_found("federate");
        };
        match query {
            "name" => serde_json::json!(federate.name).to_string(),
            "exists" => serde_json::json!(true).to_string(),
            "state" => serde_json::json!(format!("{:?}", federate.lifecycle)).to_string(),
            "current_time" => {
                serde_json::json!(federate.coordinator.granted_time().to_string()).to_string()
            }
            "timing" => serde_json::json!(federate.coordinator.time_status()).to_string(),
            "inputs" => {
                let mut names: Vec<_> =
                    federate.inputs.values().map(|i| i.name.clone()).collect();
                names.sort();
                query::name_list(names)
            }
            "publications" => {
                let mut names: Vec<_> =
                    federate.publications.values().map(|p| p.key.clone()).collect();
                names.sort();
                query::name_list(names)
            }
            "endpoints" => {
                let mut names: Vec<_> =
                    federate.endpoints.values().map(|e| e.name.clone()).collect();
                names.sort();
                query::name_list(names)
            }
            "dependencies" => serde_json::json!(federate
                .coordinator
                .dependency_ids()
                .iter()
                .map(|id| id.0)
                .collect::<Vec<_>>())
            .to_string(),
            "dependents" => serde_json::json!(federate
                .coordinator
                .dependent_ids()
                .iter()
                .map(|id| id.0)
                .collect::<Vec<_>>())
            .to_string(),
            _ => query::unknown_query(query),
        }
    }
}
