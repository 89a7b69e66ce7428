//! Tracking of upstream timing dependencies for one time coordinator.

use metronome_core::{
    command::{Action, ActionMessage, MessageFlags},
    GlobalFederateId, Time,
};

/// Where a dependency stands in the exec/time handshake. Ordering matters:
/// readiness checks compare against [`TimeState::ExecRequested`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TimeState {
    #[default]
    Initialized,
    ExecRequestedIterative,
    ExecRequested,
    TimeGranted,
    TimeRequestedIterative,
    TimeRequested,
}

/// Last reported timing state of one upstream federate.
#[derive(Debug, Clone)]
pub struct DependencyInfo {
    pub id: GlobalFederateId,
    pub state: TimeState,
    /// Earliest time this dependency may next produce an event.
    pub tnext: Time,
    /// Its earliest-event time.
    pub te: Time,
    /// Its minimum dependent-event time.
    pub tdemin: Time,
}

impl DependencyInfo {
    fn new(id: GlobalFederateId) -> Self {
        DependencyInfo {
            id,
            state: TimeState::Initialized,
            tnext: Time::ZERO,
            te: Time::ZERO,
            tdemin: Time::ZERO,
        }
    }

    /// Fold a timing command from this dependency into the record. Returns
    /// false when the command kind carries no timing information.
    fn process_message(&mut self, cmd: &ActionMessage) -> bool {
        let iterative = cmd.has_flag(MessageFlags::ITERATION_REQUESTED);
        match cmd.action {
            Action::ExecRequest => {
                self.state = if iterative {
                    TimeState::ExecRequestedIterative
                } else {
                    TimeState::ExecRequested
                };
            }
            Action::ExecGrant => {
                if iterative {
                    // the dependency went back for another init iteration
                    self.state = TimeState::Initialized;
                } else {
                    self.state = TimeState::TimeGranted;
                    self.tnext = Time::ZERO;
                    self.te = Time::ZERO;
                    self.tdemin = Time::ZERO;
                }
            }
            Action::TimeRequest => {
                self.state = if iterative {
                    TimeState::TimeRequestedIterative
                } else {
                    TimeState::TimeRequested
                };
                self.tnext = cmd.action_time;
                self.te = cmd.te;
                self.tdemin = cmd.tdemin;
            }
            Action::TimeGrant => {
                self.state = TimeState::TimeGranted;
                self.tnext = cmd.action_time;
                self.te = self.tnext;
                self.tdemin = self.tnext;
            }
            Action::Disconnect | Action::GlobalError => {
                // a disconnected dependency never constrains a grant again
                self.state = TimeState::TimeRequested;
                self.tnext = Time::MAXTIME;
                self.te = Time::MAXTIME;
                self.tdemin = Time::MAXTIME;
            }
            _ => return false,
        }
        true
    }
}

/// The set of upstream dependencies, kept sorted by id.
#[derive(Debug, Default)]
pub struct TimeDependencies {
    deps: Vec<DependencyInfo>,
}

impl TimeDependencies {
    pub fn new() -> Self {
        TimeDependencies::default()
    }

    pub fn is_empty(&self) -> bool {
        self.deps.is_empty()
    }

    pub fn len(&self) -> usize {
        self.deps.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DependencyInfo> {
        self.deps.iter()
    }

    pub fn contains(&self, id: GlobalFederateId) -> bool {
        self.deps.binary_search_by_key(&id, |d| d.id).is_ok()
    }

    /// Returns false if the dependency was already present.
    pub fn add(&mut self, id: GlobalFederateId) -> bool {
        match self.deps.binary_search_by_key(&id, |d| d.id) {
            Ok(_) => false,
            Err(pos) => {
                self.deps.insert(pos, DependencyInfo::new(id));
                true
            }
        }
    }

    pub fn remove(&mut self, id: GlobalFederateId) {
        if let Ok(pos) = self.deps.binary_search_by_key(&id, |d| d.id) {
            self.deps.remove(pos);
        }
    }

    pub fn get(&self, id: GlobalFederateId) -> Option<&DependencyInfo> {
        self.deps.binary_search_by_key(&id, |d| d.id).ok().map(|pos| &self.deps[pos])
    }

    /// Fold a timing command from its source dependency into the set.
    /// Returns true when a record changed.
    pub fn update_time(&mut self, cmd: &ActionMessage) -> bool {
        match self.deps.binary_search_by_key(&cmd.source_id, |d| d.id) {
            Ok(pos) => self.deps[pos].process_message(cmd),
            Err(_) => false,
        }
    }

    /// Whether all dependencies have reported far enough to enter execution
    /// mode.
    pub fn check_if_ready_for_exec_entry(&self, iterating: bool) -> bool {
        if iterating {
            self.deps.iter().all(|dep| dep.state != TimeState::Initialized)
        } else {
            self.deps.iter().all(|dep| dep.state >= TimeState::ExecRequested)
        }
    }

    /// Whether all dependencies allow a grant at `desired_grant_time`.
    ///
    /// A dependency granted at exactly the desired time may still produce
    /// events for that instant, so it blocks until it requests past it.
    pub fn check_if_ready_for_time_grant(&self, iterating: bool, desired_grant_time: Time) -> bool {
        self.deps.iter().all(|dep| {
            if dep.tnext < desired_grant_time {
                return false;
            }
            if dep.tnext == desired_grant_time && dep.state == TimeState::TimeGranted {
                return false;
            }
            let _ = iterating;
            true
        })
    }

    /// After granting an iteration at `time`, dependencies that were
    /// iteratively requesting that instant are treated as granted there.
    pub fn reset_iterating_time_requests(&mut self, time: Time) {
        for dep in &mut self.deps {
            if dep.state == TimeState::TimeRequestedIterative && dep.tnext == time {
                dep.state = TimeState::TimeGranted;
                dep.te = time;
                dep.tdemin = time;
            }
        }
    }

    /// After an init iteration, iterative exec requests return to the
    /// initialized state and must re-request.
    pub fn reset_iterating_exec_requests(&mut self) {
        for dep in &mut self.deps {
            if dep.state == TimeState::ExecRequestedIterative {
                dep.state = TimeState::Initialized;
            }
        }
    }

    /// Whether any dependency can still produce events.
    pub fn has_active_time_dependencies(&self) -> bool {
        self.deps.iter().any(|dep| dep.tnext < Time::MAXTIME)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn time_request(source: GlobalFederateId, t: Time) -> ActionMessage {
        let mut cmd = ActionMessage::new(Action::TimeRequest);
        cmd.source_id = source;
        cmd.action_time = t;
        cmd.te = t;
        cmd.tdemin = t;
        cmd
    }

    #[test]
    fn add_is_sorted_and_deduplicated() {
        let mut deps = TimeDependencies::new();
        assert!(deps.add(GlobalFederateId(7)));
        assert!(deps.add(GlobalFederateId(3)));
        assert!(!deps.add(GlobalFederateId(7)));
        let ids: Vec<_> = deps.iter().map(|d| d.id.0).collect();
        assert_eq!(ids, vec![3, 7]);
    }

    #[test]
    fn exec_entry_readiness() {
        let mut deps = TimeDependencies::new();
        deps.add(GlobalFederateId(1));
        assert!(!deps.check_if_ready_for_exec_entry(false));

        let mut exec_req = ActionMessage::new(Action::ExecRequest);
        exec_req.source_id = GlobalFederateId(1);
        deps.update_time(&exec_req);
        assert!(deps.check_if_ready_for_exec_entry(false));

        // an iterative exec request is sufficient only for iterating entry
        let mut iter_req = ActionMessage::new(Action::ExecRequest);
        iter_req.source_id = GlobalFederateId(1);
        iter_req.set_flag(MessageFlags::ITERATION_REQUESTED);
        deps.update_time(&iter_req);
        assert!(!deps.check_if_ready_for_exec_entry(false));
        assert!(deps.check_if_ready_for_exec_entry(true));
    }

    #[test]
    fn grant_readiness_blocks_on_equal_granted_time() {
        let mut deps = TimeDependencies::new();
        deps.add(GlobalFederateId(1));
        let t = Time::from_secs(10);

        deps.update_time(&time_request(GlobalFederateId(1), t));
        assert!(deps.check_if_ready_for_time_grant(false, t));

        let mut grant = ActionMessage::new(Action::TimeGrant);
        grant.source_id = GlobalFederateId(1);
        grant.action_time = t;
        deps.update_time(&grant);
        // granted at exactly t: may still emit events for t
        assert!(!deps.check_if_ready_for_time_grant(false, t));

        deps.update_time(&time_request(GlobalFederateId(1), Time::from_secs(20)));
        assert!(deps.check_if_ready_for_time_grant(false, t));
    }

    #[test]
    fn disconnect_clears_the_constraint() {
        let mut deps = TimeDependencies::new();
        deps.add(GlobalFederateId(1));
        deps.update_time(&time_request(GlobalFederateId(1), Time::from_secs(1)));
        assert!(deps.has_active_time_dependencies());

        let mut bye = ActionMessage::new(Action::Disconnect);
        bye.source_id = GlobalFederateId(1);
        deps.update_time(&bye);
        assert!(!deps.has_active_time_dependencies());
        assert!(deps.check_if_ready_for_time_grant(false, Time::MAXTIME));
    }
}
