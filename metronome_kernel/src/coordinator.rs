//! The per-federate time coordinator: tracks upstream dependencies, derives
//! the candidate execution time, and decides grants and iterations.
//!
//! All functions here are total and synchronous; outbound commands go
//! through an injected send callback and the caller drives the state
//! machine from its command-processing loop.

use metronome_core::{
    command::{Action, ActionMessage, MessageFlags},
    GlobalFederateId, Time,
};

use crate::{
    config::FederateTimingConfig,
    dependencies::{DependencyInfo, TimeDependencies, TimeState},
};

/// What a federate asks for when entering exec mode or requesting time.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum IterationRequest {
    #[default]
    NoIterations,
    ForceIteration,
    IterateIfNeeded,
}

impl IterationRequest {
    pub fn is_iterative(self) -> bool {
        !matches!(self, IterationRequest::NoIterations)
    }
}

/// Outcome of a grant check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationState {
    /// Granted; simulation advances to the new time.
    NextStep,
    /// Granted another iteration at the same instant.
    Iterating,
    /// The federation can never produce another event for this federate.
    Halted,
    /// No decision yet; keep processing commands.
    ContinueProcessing,
}

/// Disposition of an inbound timing command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeProcessResult {
    Processed,
    /// The command must be requeued and retried after the current grant
    /// window resolves.
    DelayProcessing,
    NoEffect,
}

/// Marker for an untrustworthy minimum-dependent-event aggregate, matching
/// the wire convention of sending -1.
const INVALID_MINMINDE: Time = Time::from_ns(-1);

type SendFn = Box<dyn FnMut(ActionMessage) + Send>;

pub struct TimeCoordinator {
    source_id: GlobalFederateId,
    config: FederateTimingConfig,

    time_granted: Time,
    time_grant_base: Time,
    time_requested: Time,
    /// Next pending value-update time.
    time_value: Time,
    /// Next pending message-arrival time.
    time_message: Time,
    /// Candidate execution time.
    time_exec: Time,
    /// Earliest time at which this federate might next produce an event.
    time_next: Time,
    time_minde: Time,
    time_minminde: Time,
    /// Earliest time any dependency allows us to reach.
    time_allow: Time,
    /// Earliest unreleased barrier.
    time_block: Time,
    time_blocks: Vec<(Time, i32)>,

    dependencies: TimeDependencies,
    /// Kept sorted for deterministic broadcast order.
    dependents: Vec<GlobalFederateId>,

    iterating: bool,
    checking_exec: bool,
    execution_mode: bool,
    has_init_updates: bool,
    iteration: u16,

    send: SendFn,
}

impl std::fmt::Debug for TimeCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeCoordinator")
            .field("source_id", &self.source_id)
            .field("granted", &self.time_granted)
            .field("exec", &self.time_exec)
            .field("allow", &self.time_allow)
            .field("iterating", &self.iterating)
            .finish_non_exhaustive()
    }
}

impl TimeCoordinator {
    pub fn new(
        source_id: GlobalFederateId,
        config: FederateTimingConfig,
        send: impl FnMut(ActionMessage) + Send + 'static,
    ) -> Self {
        let mut config = config;
        if config.time_delta <= Time::ZERO {
            config.time_delta = Time::EPSILON;
        }
        TimeCoordinator {
            source_id,
            config,
            time_granted: Time::ZERO,
            time_grant_base: Time::ZERO,
            time_requested: Time::MAXTIME,
            time_value: Time::MAXTIME,
            time_message: Time::MAXTIME,
            time_exec: Time::MAXTIME,
            time_next: Time::ZERO,
            time_minde: Time::ZERO,
            time_minminde: Time::ZERO,
            time_allow: Time::ZERO,
            time_block: Time::MAXTIME,
            time_blocks: Vec::new(),
            dependencies: TimeDependencies::new(),
            dependents: Vec::new(),
            iterating: false,
            checking_exec: false,
            execution_mode: false,
            has_init_updates: false,
            iteration: 0,
            send: Box::new(send),
        }
    }

    pub fn source_id(&self) -> GlobalFederateId {
        self.source_id
    }

    pub fn granted_time(&self) -> Time {
        self.time_granted
    }

    pub fn in_execution_mode(&self) -> bool {
        self.execution_mode
    }

    pub fn iteration(&self) -> u16 {
        self.iteration
    }

    pub fn config(&self) -> &FederateTimingConfig {
        &self.config
    }

    pub fn dependency_ids(&self) -> Vec<GlobalFederateId> {
        self.dependencies.iter().map(|d| d.id).collect()
    }

    pub fn dependent_ids(&self) -> &[GlobalFederateId] {
        &self.dependents
    }

    pub fn has_active_time_dependencies(&self) -> bool {
        self.dependencies.has_active_time_dependencies()
    }

    // --- dependency management ---

    pub fn is_dependency(&self, id: GlobalFederateId) -> bool {
        self.dependencies.contains(id)
    }

    pub fn add_dependency(&mut self, id: GlobalFederateId) -> bool {
        self.dependencies.add(id)
    }

    pub fn remove_dependency(&mut self, id: GlobalFederateId) {
        self.dependencies.remove(id);
    }

    pub fn add_dependent(&mut self, id: GlobalFederateId) -> bool {
        match self.dependents.binary_search(&id) {
            Ok(_) => false,
            Err(pos) => {
                self.dependents.insert(pos, id);
                true
            }
        }
    }

    pub fn remove_dependent(&mut self, id: GlobalFederateId) {
        if let Ok(pos) = self.dependents.binary_search(&id) {
            self.dependents.remove(pos);
        }
    }

    pub fn dependency_info(&self, id: GlobalFederateId) -> Option<&DependencyInfo> {
        self.dependencies.get(id)
    }

    pub fn process_dependency_update(&mut self, cmd: &ActionMessage) {
        match cmd.action {
            Action::AddDependency => {
                self.add_dependency(cmd.source_id);
            }
            Action::RemoveDependency => self.remove_dependency(cmd.source_id),
            Action::AddDependent => {
                self.add_dependent(cmd.source_id);
            }
            Action::RemoveDependent => self.remove_dependent(cmd.source_id),
            Action::AddInterdependency => {
                self.add_dependency(cmd.source_id);
                self.add_dependent(cmd.source_id);
            }
            Action::RemoveInterdependency => {
                self.remove_dependency(cmd.source_id);
                self.remove_dependent(cmd.source_id);
            }
            _ => {}
        }
    }

    // --- exec mode entry ---

    /// Announce the intent to enter execution mode to all dependents.
    pub fn entering_exec_mode(&mut self, mode: IterationRequest) {
        if self.execution_mode {
            return;
        }
        self.iterating = mode.is_iterative();
        self.checking_exec = true;
        let mut execreq = ActionMessage::new(Action::ExecRequest);
        execreq.source_id = self.source_id;
        if self.iterating {
            execreq.set_flag(MessageFlags::ITERATION_REQUESTED);
        }
        self.transmit_timing_message(execreq);
    }

    /// Decide whether execution mode can be entered.
    pub fn check_exec_entry(&mut self) -> IterationState {
        if self.time_block <= Time::ZERO {
            return IterationState::ContinueProcessing;
        }
        if !self.dependencies.check_if_ready_for_exec_entry(self.iterating) {
            return IterationState::ContinueProcessing;
        }
        let ret = if self.iterating {
            if self.has_init_updates {
                if self.iteration >= self.config.max_iterations {
                    IterationState::NextStep
                } else {
                    IterationState::Iterating
                }
            } else {
                IterationState::NextStep
            }
        } else {
            IterationState::NextStep
        };

        match ret {
            IterationState::NextStep => {
                self.time_granted = Time::ZERO;
                self.time_grant_base = Time::ZERO;
                self.execution_mode = true;
                self.iteration = 0;
                self.checking_exec = false;

                let mut execgrant = ActionMessage::new(Action::ExecGrant);
                execgrant.source_id = self.source_id;
                self.transmit_timing_message(execgrant);
            }
            IterationState::Iterating => {
                self.dependencies.reset_iterating_exec_requests();
                self.has_init_updates = false;
                self.iteration += 1;
                let mut execgrant = ActionMessage::new(Action::ExecGrant);
                execgrant.source_id = self.source_id;
                execgrant.counter = self.iteration;
                execgrant.set_flag(MessageFlags::ITERATION_REQUESTED);
                self.transmit_timing_message(execgrant);
            }
            _ => {}
        }
        ret
    }

    // --- time requests ---

    /// Register a request to advance to `next_time`, along with the earliest
    /// pending value-update and message-arrival times.
    pub fn time_request(
        &mut self,
        mut next_time: Time,
        iterate: IterationRequest,
        new_value_time: Time,
        new_message_time: Time,
    ) {
        self.iterating = iterate.is_iterative();
        if self.iterating {
            if next_time < self.time_granted {
                next_time = self.time_granted;
            }
        } else {
            let floor = self.next_possible_time();
            if next_time < floor {
                next_time = floor;
            }
        }
        self.time_requested = next_time;
        self.time_value = new_value_time;
        self.time_message = new_message_time;
        self.update_time_factors();

        if !self.dependents.is_empty() {
            self.send_time_request();
        }
    }

    /// Broadcast a disconnect to all dependents.
    pub fn disconnect(&mut self) {
        let mut bye = ActionMessage::new(Action::Disconnect);
        bye.source_id = self.source_id;
        self.transmit_timing_message(bye);
    }

    /// Earliest time grantable from the current state, honoring timeDelta,
    /// period, and offset.
    pub fn next_possible_time(&self) -> Time {
        let info = &self.config;
        if self.time_granted == Time::ZERO {
            if info.offset > info.time_delta {
                return info.offset;
            }
            if info.offset == Time::ZERO {
                return self.generate_allowed_time(info.time_delta.max(info.period));
            }
            if info.period <= Time::EPSILON {
                return info.time_delta;
            }
            let mut ret = info.offset + info.period;
            while ret < info.time_delta {
                ret += info.period;
            }
            return ret;
        }
        self.generate_allowed_time(self.time_grant_base + info.time_delta.max(info.period))
    }

    /// Snap `test_time` up onto the period grid anchored at the grant base.
    pub fn generate_allowed_time(&self, mut test_time: Time) -> Time {
        let period = self.config.period;
        if period > Time::EPSILON {
            if test_time.is_max() {
                return test_time;
            }
            if test_time - self.time_grant_base > period {
                let blocks = (test_time - self.time_grant_base).div_ceil(period);
                test_time = self.time_grant_base + period * blocks;
            } else {
                test_time = self.time_grant_base + period;
            }
        }
        test_time
    }

    /// Recompute the candidate execution time; true when it moved.
    fn update_next_execution_time(&mut self) -> bool {
        let previous = self.time_exec;
        self.time_exec = self.time_message.min(self.time_value);
        if self.time_exec < Time::MAXTIME {
            self.time_exec += self.config.input_delay;
        }
        self.time_exec = self.time_requested.min(self.time_exec);
        if self.time_exec <= self.time_granted {
            self.time_exec =
                if self.iterating { self.time_granted } else { self.next_possible_time() };
        }
        // the floor from next_possible_time is already a valid grant point
        // (it carries the offset); only times off that floor get snapped
        // onto the period grid
        if self.time_exec > self.time_granted && self.time_exec != self.next_possible_time() {
            self.time_exec = self.generate_allowed_time(self.time_exec);
        }
        self.time_exec != previous
    }

    fn update_next_possible_event_time(&mut self) {
        self.time_next =
            if self.iterating { self.time_granted } else { self.next_possible_time() };
        if self.time_minminde < Time::MAXTIME
            && self.time_minminde + self.config.input_delay > self.time_next
        {
            self.time_next =
                self.generate_allowed_time(self.time_minminde + self.config.input_delay);
        }
        self.time_next = self.time_next.min(self.time_exec) + self.config.output_delay;
    }

    /// Aggregate dependency state into the time factors; true when anything
    /// that rides on an outbound time request changed.
    pub fn update_time_factors(&mut self) -> bool {
        let mut min_next = Time::MAXTIME;
        let mut minminde = self.time_value.min(self.time_message);
        let mut minde = minminde;
        for dep in self.dependencies.iter() {
            if dep.tnext < min_next {
                min_next = dep.tnext;
            }
            if dep.tdemin >= dep.tnext {
                if dep.tdemin < minminde {
                    minminde = dep.tdemin;
                }
            } else {
                // an inconsistent report cannot be trusted for grant decisions
                minminde = INVALID_MINMINDE;
            }
            if dep.te < minde {
                minde = dep.te;
            }
        }

        let mut update = false;
        self.time_minminde = minde.min(minminde);
        let prev_next = self.time_next;
        self.update_next_possible_event_time();
        if prev_next != self.time_next {
            update = true;
        }
        let minde = if minde < Time::MAXTIME {
            self.generate_allowed_time(minde) + self.config.output_delay
        } else {
            minde
        };
        if minde != self.time_minde {
            update = true;
            self.time_minde = minde;
        }
        self.time_allow = if min_next < Time::MAXTIME {
            self.config.input_delay + min_next
        } else {
            Time::MAXTIME
        };
        self.update_next_execution_time();
        update
    }

    /// Decide whether a time grant (or iteration) can be issued now.
    pub fn check_time_grant(&mut self) -> IterationState {
        let update = self.update_time_factors();
        if self.time_exec.is_max() && self.time_allow.is_max() {
            // nothing pending anywhere: terminal halt
            self.time_granted = Time::MAXTIME;
            self.time_grant_base = Time::MAXTIME;
            let mut bye = ActionMessage::new(Action::Disconnect);
            bye.source_id = self.source_id;
            self.transmit_timing_message(bye);
            return IterationState::Halted;
        }
        if self.time_block <= self.time_exec {
            return IterationState::ContinueProcessing;
        }
        if !self.iterating || self.time_exec > self.time_granted {
            self.iteration = 0;
            if self.time_allow > self.time_exec {
                self.update_time_grant();
                return IterationState::NextStep;
            }
            if self.time_allow == self.time_exec {
                if self.time_requested <= self.time_exec {
                    self.update_time_grant();
                    return IterationState::NextStep;
                }
                if self.dependencies.check_if_ready_for_time_grant(false, self.time_exec) {
                    self.update_time_grant();
                    return IterationState::NextStep;
                }
            }
        } else {
            if self.time_allow > self.time_exec {
                self.iteration += 1;
                self.update_time_grant();
                return IterationState::Iterating;
            }
            if self.time_allow == self.time_exec
                && self.dependencies.check_if_ready_for_time_grant(true, self.time_exec)
            {
                self.iteration += 1;
                self.update_time_grant();
                return IterationState::Iterating;
            }
        }

        // no grant; propagate updated factors if they moved
        if !self.dependents.is_empty() && update {
            self.send_time_request();
        }
        IterationState::ContinueProcessing
    }

    fn send_time_request(&mut self) {
        let mut upd = ActionMessage::new(Action::TimeRequest);
        upd.source_id = self.source_id;
        upd.action_time = self.time_next;
        upd.te = if self.time_exec.is_max() {
            self.time_exec
        } else {
            self.time_exec + self.config.output_delay
        };
        upd.tdemin = self.time_next.max(self.time_minde);
        if self.iterating {
            upd.set_flag(MessageFlags::ITERATION_REQUESTED);
            upd.counter = self.iteration;
        }
        self.transmit_timing_message(upd);
    }

    fn update_time_grant(&mut self) {
        self.time_granted = self.time_exec;
        self.time_grant_base = self.time_granted;

        let mut grant = ActionMessage::new(Action::TimeGrant);
        grant.source_id = self.source_id;
        grant.action_time = self.time_granted;
        grant.counter = self.iteration;
        if self.iterating {
            grant.set_flag(MessageFlags::ITERATION_REQUESTED);
            self.dependencies.reset_iterating_time_requests(self.time_exec);
        }
        self.transmit_timing_message(grant);
    }

    // --- local update hooks ---

    /// A value arrived for one of this federate's inputs at `update_time`.
    pub fn update_value_time(&mut self, update_time: Time) {
        if !self.execution_mode {
            if update_time < Time::ZERO {
                self.has_init_updates = true;
            }
            return;
        }
        if update_time < self.time_value {
            let previous = self.time_value;
            self.time_value = self.clamp_update_time(update_time);
            if self.time_value < previous && self.update_next_execution_time() {
                self.send_time_request();
            }
        }
    }

    /// A message arrived for one of this federate's endpoints at
    /// `update_time`.
    pub fn update_message_time(&mut self, update_time: Time) {
        if !self.execution_mode {
            if update_time < Time::ZERO {
                self.has_init_updates = true;
            }
            return;
        }
        if update_time < self.time_message {
            let previous = self.time_message;
            self.time_message = self.clamp_update_time(update_time);
            if self.time_message < previous && self.update_next_execution_time() {
                self.send_time_request();
            }
        }
    }

    fn clamp_update_time(&self, update_time: Time) -> Time {
        if self.iterating {
            if update_time <= self.time_granted {
                self.time_granted
            } else {
                update_time
            }
        } else {
            let floor = self.next_possible_time();
            if update_time <= floor {
                floor
            } else {
                update_time
            }
        }
    }

    // --- inbound command processing ---

    /// Fold an inbound timing command into the dependency state.
    pub fn process_time_message(&mut self, cmd: &ActionMessage) -> TimeProcessResult {
        if matches!(cmd.action, Action::TimeBlock | Action::TimeUnblock) {
            return self.process_time_block_message(cmd);
        }
        if self.is_delayable_message(cmd) {
            let Some(dep) = self.dependencies.get(cmd.source_id) else {
                return TimeProcessResult::NoEffect;
            };
            match dep.state {
                TimeState::TimeRequested => {
                    if dep.tnext > self.time_exec {
                        return TimeProcessResult::DelayProcessing;
                    }
                }
                TimeState::TimeRequestedIterative => {
                    if dep.tnext > self.time_exec {
                        return TimeProcessResult::DelayProcessing;
                    }
                    if self.iterating && self.time_exec == dep.tnext {
                        return TimeProcessResult::DelayProcessing;
                    }
                }
                TimeState::ExecRequestedIterative => {
                    if self.iterating && self.checking_exec {
                        return TimeProcessResult::DelayProcessing;
                    }
                }
                _ => {}
            }
        }
        if self.dependencies.update_time(cmd) {
            TimeProcessResult::Processed
        } else {
            TimeProcessResult::NoEffect
        }
    }

    /// Grants from peers can race the local grant window and must sometimes
    /// wait for the next round.
    fn is_delayable_message(&self, cmd: &ActionMessage) -> bool {
        matches!(cmd.action, Action::TimeGrant | Action::ExecGrant) && cmd.source_id != self.source_id
    }

    fn process_time_block_message(&mut self, cmd: &ActionMessage) -> TimeProcessResult {
        match cmd.action {
            Action::TimeBlock => {
                self.time_blocks.push((cmd.action_time, cmd.extra_data));
                if cmd.action_time < self.time_block {
                    self.time_block = cmd.action_time;
                }
                TimeProcessResult::Processed
            }
            Action::TimeUnblock => {
                if self.time_blocks.is_empty() {
                    return TimeProcessResult::NoEffect;
                }
                let released = self
                    .time_blocks
                    .iter()
                    .position(|(_, index)| *index == cmd.extra_data)
                    .map(|pos| self.time_blocks.remove(pos).0);
                match released {
                    Some(time) if time <= self.time_block => {
                        self.time_block = self
                            .time_blocks
                            .iter()
                            .map(|(t, _)| *t)
                            .min()
                            .unwrap_or(Time::MAXTIME);
                        TimeProcessResult::Processed
                    }
                    Some(_) => TimeProcessResult::NoEffect,
                    None => TimeProcessResult::NoEffect,
                }
            }
            _ => TimeProcessResult::NoEffect,
        }
    }

    /// Apply a configuration-update command.
    pub fn process_config_update(&mut self, cmd: &ActionMessage, init_mode: bool) {
        self.config.process_update(cmd, init_mode);
    }

    /// One-line rendering of the timing factors for queries and logs.
    pub fn time_status(&self) -> String {
        format!(
            "exec={} allow={} value={} message={} minDe={} minminDe={}",
            self.time_exec,
            self.time_allow,
            self.time_value,
            self.time_message,
            self.time_minde,
            self.time_minminde
        )
    }

    fn transmit_timing_message(&mut self, mut msg: ActionMessage) {
        for dep in &self.dependents {
            msg.dest_id = *dep;
            (self.send)(msg.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn coordinator_pair(
        config: FederateTimingConfig,
    ) -> (TimeCoordinator, Arc<Mutex<Vec<ActionMessage>>>) {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let sink = sent.clone();
        let coord = TimeCoordinator::new(GlobalFederateId::new_federate(0), config, move |msg| {
            sink.lock().unwrap().push(msg);
        });
        (coord, sent)
    }

    /// Walk a solo coordinator (no dependencies) into execution mode.
    fn enter_exec(coord: &mut TimeCoordinator) {
        coord.entering_exec_mode(IterationRequest::NoIterations);
        assert_eq!(coord.check_exec_entry(), IterationState::NextStep);
        assert!(coord.in_execution_mode());
    }

    /// Walk a coordinator with dependencies into execution mode by feeding
    /// exec requests from each upstream first.
    fn enter_exec_with_deps(coord: &mut TimeCoordinator, upstream: &[GlobalFederateId]) {
        coord.entering_exec_mode(IterationRequest::NoIterations);
        for id in upstream {
            let mut exec_req = ActionMessage::new(Action::ExecRequest);
            exec_req.source_id = *id;
            coord.process_time_message(&exec_req);
        }
        assert_eq!(coord.check_exec_entry(), IterationState::NextStep);
        assert!(coord.in_execution_mode());
    }

    #[test]
    fn solo_federate_grants_requested_times() {
        let (mut coord, _) =
            coordinator_pair(FederateTimingConfig::default().with_time_delta(Time::from_secs(1)));
        enter_exec(&mut coord);

        coord.time_request(
            Time::from_secs(50),
            IterationRequest::NoIterations,
            Time::MAXTIME,
            Time::MAXTIME,
        );
        assert_eq!(coord.check_time_grant(), IterationState::NextStep);
        assert_eq!(coord.granted_time(), Time::from_secs(50));

        coord.time_request(
            Time::from_secs(100),
            IterationRequest::NoIterations,
            Time::MAXTIME,
            Time::MAXTIME,
        );
        assert_eq!(coord.check_time_grant(), IterationState::NextStep);
        assert_eq!(coord.granted_time(), Time::from_secs(100));
    }

    #[test]
    fn granted_time_is_monotonic() {
        let (mut coord, _) = coordinator_pair(FederateTimingConfig::default());
        enter_exec(&mut coord);
        let mut last = coord.granted_time();
        for req in [1.0, 0.5, 2.0, 1.5, 10.0] {
            coord.time_request(
                Time::from_secs_f64(req),
                IterationRequest::NoIterations,
                Time::MAXTIME,
                Time::MAXTIME,
            );
            assert_eq!(coord.check_time_grant(), IterationState::NextStep);
            assert!(coord.granted_time() >= last);
            last = coord.granted_time();
        }
    }

    #[test]
    fn period_offset_grid() {
        // period 2s, offset 0.5s: the grant grid is 0.5, 2.5, 4.5, ...
        let (mut coord, _) = coordinator_pair(
            FederateTimingConfig::default().with_period(Time::from_secs(2), Time::from_secs_f64(0.5)),
        );
        enter_exec(&mut coord);

        coord.time_request(
            Time::from_secs_f64(0.5),
            IterationRequest::NoIterations,
            Time::MAXTIME,
            Time::MAXTIME,
        );
        assert_eq!(coord.check_time_grant(), IterationState::NextStep);
        assert_eq!(coord.granted_time(), Time::from_secs_f64(0.5));

        coord.time_request(
            Time::from_secs_f64(1.2),
            IterationRequest::NoIterations,
            Time::MAXTIME,
            Time::MAXTIME,
        );
        assert_eq!(coord.check_time_grant(), IterationState::NextStep);
        assert_eq!(coord.granted_time(), Time::from_secs_f64(2.5));
    }

    #[test]
    fn exec_time_stays_grid_aligned() {
        let (mut coord, _) = coordinator_pair(
            FederateTimingConfig::default().with_period(Time::from_secs(3), Time::ZERO),
        );
        enter_exec(&mut coord);
        for req in [1.0, 4.0, 7.5, 8.9] {
            coord.time_request(
                Time::from_secs_f64(req),
                IterationRequest::NoIterations,
                Time::MAXTIME,
                Time::MAXTIME,
            );
            assert_eq!(coord.check_time_grant(), IterationState::NextStep);
            let granted = coord.granted_time();
            assert_eq!(granted.as_ns() % Time::from_secs(3).as_ns(), 0, "granted {granted}");
        }
    }

    #[test]
    fn dependency_gates_grant() {
        let (mut coord, _) = coordinator_pair(FederateTimingConfig::default());
        let upstream = GlobalFederateId::new_federate(9);
        coord.add_dependency(upstream);
        enter_exec_with_deps(&mut coord, &[upstream]);

        coord.time_request(
            Time::from_secs(10),
            IterationRequest::NoIterations,
            Time::MAXTIME,
            Time::MAXTIME,
        );
        assert_eq!(coord.check_time_grant(), IterationState::ContinueProcessing);

        // upstream requests past our time: now safe
        let mut req = ActionMessage::new(Action::TimeRequest);
        req.source_id = upstream;
        req.action_time = Time::from_secs(20);
        req.te = Time::from_secs(20);
        req.tdemin = Time::from_secs(20);
        assert_eq!(coord.process_time_message(&req), TimeProcessResult::Processed);
        assert_eq!(coord.check_time_grant(), IterationState::NextStep);
        assert_eq!(coord.granted_time(), Time::from_secs(10));
    }

    #[test]
    fn exec_iteration_respects_max_iterations() {
        let (mut coord, _) =
            coordinator_pair(FederateTimingConfig::default().with_max_iterations(3));
        // persistent init updates force iteration until the limit
        coord.update_value_time(Time::from_ns(-1));
        coord.entering_exec_mode(IterationRequest::IterateIfNeeded);
        let mut iterations = 0;
        loop {
            match coord.check_exec_entry() {
                IterationState::Iterating => {
                    iterations += 1;
                    // updates keep arriving during init
                    coord.update_value_time(Time::from_ns(-1));
                }
                IterationState::NextStep => break,
                other => panic!("unexpected exec entry result {other:?}"),
            }
            assert!(iterations <= 3, "iteration must stop at the limit");
        }
        assert_eq!(iterations, 3);
        assert!(coord.in_execution_mode());
    }

    #[test]
    fn time_block_defers_grant() {
        let (mut coord, _) = coordinator_pair(FederateTimingConfig::default());
        enter_exec(&mut coord);

        let mut block = ActionMessage::new(Action::TimeBlock);
        block.action_time = Time::from_secs(5);
        block.extra_data = 1;
        assert_eq!(coord.process_time_message(&block), TimeProcessResult::Processed);

        coord.time_request(
            Time::from_secs(10),
            IterationRequest::NoIterations,
            Time::MAXTIME,
            Time::MAXTIME,
        );
        assert_eq!(coord.check_time_grant(), IterationState::ContinueProcessing);

        let mut unblock = ActionMessage::new(Action::TimeUnblock);
        unblock.extra_data = 1;
        assert_eq!(coord.process_time_message(&unblock), TimeProcessResult::Processed);
        assert_eq!(coord.check_time_grant(), IterationState::NextStep);
    }

    #[test]
    fn terminal_halt_broadcasts_disconnect() {
        let (mut coord, sent) = coordinator_pair(FederateTimingConfig::default());
        let downstream = GlobalFederateId::new_federate(2);
        coord.add_dependent(downstream);
        let upstream = GlobalFederateId::new_federate(3);
        coord.add_dependency(upstream);
        enter_exec_with_deps(&mut coord, &[upstream]);
        sent.lock().unwrap().clear();

        let mut bye = ActionMessage::new(Action::Disconnect);
        bye.source_id = upstream;
        coord.process_time_message(&bye);

        coord.time_request(
            Time::MAXTIME,
            IterationRequest::NoIterations,
            Time::MAXTIME,
            Time::MAXTIME,
        );
        assert_eq!(coord.check_time_grant(), IterationState::Halted);
        assert_eq!(coord.granted_time(), Time::MAXTIME);
        let msgs = sent.lock().unwrap();
        assert!(msgs.iter().any(|m| m.action == Action::Disconnect && m.dest_id == downstream));
    }

    #[test]
    fn delayable_grant_is_deferred_past_exec_window() {
        let (mut coord, _) = coordinator_pair(FederateTimingConfig::default());
        let upstream = GlobalFederateId::new_federate(5);
        coord.add_dependency(upstream);
        enter_exec_with_deps(&mut coord, &[upstream]);

        // upstream requested a time beyond our candidate execution time
        let mut req = ActionMessage::new(Action::TimeRequest);
        req.source_id = upstream;
        req.action_time = Time::from_secs(30);
        req.te = Time::from_secs(30);
        req.tdemin = Time::from_secs(30);
        coord.process_time_message(&req);

        coord.time_request(
            Time::from_secs(10),
            IterationRequest::NoIterations,
            Time::MAXTIME,
            Time::MAXTIME,
        );

        // a grant from that upstream must wait until the local window resolves
        let mut grant = ActionMessage::new(Action::TimeGrant);
        grant.source_id = upstream;
        grant.action_time = Time::from_secs(30);
        assert_eq!(coord.process_time_message(&grant), TimeProcessResult::DelayProcessing);
    }

    #[test]
    fn broadcast_order_is_sorted() {
        let (mut coord, sent) = coordinator_pair(FederateTimingConfig::default());
        coord.add_dependent(GlobalFederateId::new_federate(9));
        coord.add_dependent(GlobalFederateId::new_federate(2));
        coord.add_dependent(GlobalFederateId::new_federate(5));
        coord.entering_exec_mode(IterationRequest::NoIterations);
        let msgs = sent.lock().unwrap();
        let dests: Vec<_> = msgs.iter().map(|m| m.dest_id).collect();
        let mut sorted = dests.clone();
        sorted.sort();
        assert_eq!(dests, sorted);
    }
}
