//! Per-federate timing configuration.

use metronome_core::{
    command::{fed_flag, update, ActionMessage, MessageFlags},
    Time,
};

/// Timing parameters and behavior flags for one federate.
#[derive(Debug, Clone)]
pub struct FederateTimingConfig {
    /// Minimum time between grants. Clamped to at least [`Time::EPSILON`].
    pub time_delta: Time,
    pub input_delay: Time,
    pub output_delay: Time,
    pub period: Time,
    pub offset: Time,
    pub max_iterations: u16,
    pub log_level: i32,
    pub uninterruptible: bool,
    pub only_transmit_on_change: bool,
    pub only_update_on_change: bool,
    pub wait_for_current_time_updates: bool,
    pub source_only: bool,
    pub observer: bool,
}

impl Default for FederateTimingConfig {
    fn default() -> Self {
        FederateTimingConfig {
            time_delta: Time::EPSILON,
            input_delay: Time::ZERO,
            output_delay: Time::ZERO,
            period: Time::ZERO,
            offset: Time::ZERO,
            max_iterations: 50,
            log_level: 0,
            uninterruptible: false,
            only_transmit_on_change: false,
            only_update_on_change: false,
            wait_for_current_time_updates: false,
            source_only: false,
            observer: false,
        }
    }
}

impl FederateTimingConfig {
    pub fn with_time_delta(mut self, time_delta: Time) -> Self {
        self.time_delta = if time_delta <= Time::ZERO { Time::EPSILON } else { time_delta };
        self
    }

    pub fn with_period(mut self, period: Time, offset: Time) -> Self {
        self.period = period;
        self.offset = offset;
        self
    }

    pub fn with_input_delay(mut self, delay: Time) -> Self {
        self.input_delay = delay;
        self
    }

    pub fn with_output_delay(mut self, delay: Time) -> Self {
        self.output_delay = delay;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: u16) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Apply a `TimeConfigure` command. Flags marked init-only are accepted
    /// only while `init_mode` holds.
    pub fn process_update(&mut self, cmd: &ActionMessage, init_mode: bool) {
        match cmd.message_id {
            update::OUTPUT_DELAY => self.output_delay = cmd.action_time,
            update::INPUT_DELAY => self.input_delay = cmd.action_time,
            update::MIN_DELTA => {
                self.time_delta = cmd.action_time;
                if self.time_delta <= Time::ZERO {
                    self.time_delta = Time::EPSILON;
                }
            }
            update::PERIOD => self.period = cmd.action_time,
            update::OFFSET => self.offset = cmd.action_time,
            update::MAX_ITERATIONS => self.max_iterations = cmd.extra_data.max(0) as u16,
            update::LOG_LEVEL => self.log_level = cmd.extra_data,
            update::FLAG => {
                let value = cmd.has_flag(MessageFlags::INDICATOR);
                match cmd.extra_data {
                    fed_flag::UNINTERRUPTIBLE => self.uninterruptible = value,
                    fed_flag::ONLY_TRANSMIT_ON_CHANGE => self.only_transmit_on_change = value,
                    fed_flag::ONLY_UPDATE_ON_CHANGE => self.only_update_on_change = value,
                    fed_flag::WAIT_FOR_CURRENT_TIME_UPDATES => {
                        self.wait_for_current_time_updates = value
                    }
                    fed_flag::SOURCE_ONLY if init_mode => self.source_only = value,
                    fed_flag::OBSERVER if init_mode => self.observer = value,
                    _ => {}
                }
            }
            _ => {}
        }
    }
}
