//! Filters on the message path.
//!
//! A filter operator maps one message to any number of outgoing messages:
//! zero drops it, more than one multiplies it. Source filters run at the
//! sending core before routing; destination filters run at the receiving
//! core before delivery; a cloning filter delivers copies to additional
//! destinations without consuming the original.

use std::collections::HashMap;

use crate::message::EndpointMessage;
use metronome_core::GlobalHandle;

pub type FilterOperator = Box<dyn FnMut(EndpointMessage) -> Vec<EndpointMessage> + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterPlacement {
    Source,
    Destination,
    /// Runs on the source side; emitted messages are delivered in addition
    /// to the unmodified original.
    CloneSource,
}

pub(crate) struct FilterInfo {
    pub placement: FilterPlacement,
    pub target_endpoint: String,
    pub operator: Option<FilterOperator>,
}

/// Registry of filters keyed by their placement target.
#[derive(Default)]
pub(crate) struct FilterRegistry {
    filters: Vec<FilterInfo>,
    by_handle: HashMap<GlobalHandle, usize>,
}

impl FilterRegistry {
    pub fn register(
        &mut self,
        handle: GlobalHandle,
        name: &str,
        placement: FilterPlacement,
        target_endpoint: &str,
    ) {
        tracing::debug!(name, ?placement, target_endpoint, "registering filter");
        let index = self.filters.len();
        self.filters.push(FilterInfo {
            placement,
            target_endpoint: target_endpoint.to_string(),
            operator: None,
        });
        self.by_handle.insert(handle, index);
    }

    pub fn set_operator(&mut self, handle: GlobalHandle, operator: FilterOperator) -> bool {
        match self.by_handle.get(&handle) {
            Some(&index) => {
                self.filters[index].operator = Some(operator);
                true
            }
            None => false,
        }
    }

    /// Run the source-side chain for a message leaving `endpoint`.
    ///
    /// Ordinary source filters transform the message in sequence; cloning
    /// filters tap it and their outputs ride along untransformed.
    pub fn apply_source(&mut self, endpoint: &str, msg: EndpointMessage) -> Vec<EndpointMessage> {
        let mut main = vec![msg];
        let mut cloned = Vec::new();
        for filter in &mut self.filters {
            if filter.target_endpoint != endpoint {
                continue;
            }
            match filter.placement {
                FilterPlacement::Source => {
                    if let Some(op) = filter.operator.as_mut() {
                        main = main.drain(..).flat_map(|m| op(m)).collect();
                    }
                }
                FilterPlacement::CloneSource => {
                    if let Some(op) = filter.operator.as_mut() {
                        cloned.extend(main.iter().cloned().flat_map(|m| op(m)));
                    }
                }
                FilterPlacement::Destination => {}
            }
        }
        main.extend(cloned);
        main
    }

    /// Run the destination-side chain for a message arriving at `endpoint`.
    pub fn apply_destination(
        &mut self,
        endpoint: &str,
        msg: EndpointMessage,
    ) -> Vec<EndpointMessage> {
        let mut main = vec![msg];
        for filter in &mut self.filters {
            if filter.placement != FilterPlacement::Destination
                || filter.target_endpoint != endpoint
            {
                continue;
            }
            if let Some(op) = filter.operator.as_mut() {
                main = main.drain(..).flat_map(|m| op(m)).collect();
            }
        }
        main
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metronome_core::{GlobalFederateId, InterfaceHandle, Time};

    fn handle(n: i32) -> GlobalHandle {
        GlobalHandle::new(GlobalFederateId::new_federate(0), InterfaceHandle(n))
    }

    fn bump_first_byte() -> FilterOperator {
        Box::new(|mut msg: EndpointMessage| {
            let mut bytes = msg.payload.release();
            if let Some(first) = bytes.first_mut() {
                *first += 1;
            }
            msg.payload = bytes.into();
            vec![msg]
        })
    }

    #[test]
    fn source_and_dest_filters_chain() {
        let mut registry = FilterRegistry::default();
        registry.register(handle(1), "f1", FilterPlacement::Source, "end1");
        registry.register(handle(2), "f2", FilterPlacement::Destination, "end2");
        assert!(registry.set_operator(handle(1), bump_first_byte()));
        assert!(registry.set_operator(handle(2), bump_first_byte()));

        let msg = EndpointMessage::new("end1", "end2", Time::ZERO, "hello world");
        let after_source = registry.apply_source("end1", msg);
        assert_eq!(after_source.len(), 1);
        assert_eq!(after_source[0].payload.as_bytes()[0], b'i');

        let after_dest = registry.apply_destination("end2", after_source[0].clone());
        assert_eq!(after_dest[0].payload.as_bytes()[0], b'j');
    }

    #[test]
    fn dropping_filter_consumes_message() {
        let mut registry = FilterRegistry::default();
        registry.register(handle(1), "drop", FilterPlacement::Source, "end1");
        registry.set_operator(handle(1), Box::new(|_| Vec::new()));
        let msg = EndpointMessage::new("end1", "end2", Time::ZERO, "x");
        assert!(registry.apply_source("end1", msg).is_empty());
    }

    #[test]
    fn cloning_filter_preserves_original() {
        let mut registry = FilterRegistry::default();
        registry.register(handle(1), "clone", FilterPlacement::CloneSource, "end1");
        registry.set_operator(
            handle(1),
            Box::new(|mut msg: EndpointMessage| {
                msg.dest = "end3".to_string();
                vec![msg]
            }),
        );
        let msg = EndpointMessage::new("end1", "end2", Time::ZERO, "x");
        let out = registry.apply_source("end1", msg);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].dest, "end2");
        assert_eq!(out[1].dest, "end3");
    }
}
