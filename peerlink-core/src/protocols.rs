//! Protocol registry: which transports are enabled and listening.

use std::collections::BTreeMap;

use crate::transport::{ListenOptions, ListenerHandle};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProtocolState {
    pub enabled: bool,
    pub listener: Option<ListenerHandle>,
    pub options: ListenOptions,
}

/// State change reported by the registry; the dispatcher forwards it to
/// protocol-state callbacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolChange {
    pub protocol: String,
    pub enabled: bool,
}

#[derive(Debug, Default)]
pub struct ProtocolRegistry {
    states: BTreeMap<String, ProtocolState>,
}

impl ProtocolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a started listener. Returns a change unless the protocol was already enabled.
    pub fn set_listening(
        &mut self,
        protocol: &str,
        listener: ListenerHandle,
        options: ListenOptions,
    ) -> Option<ProtocolChange> {
        let state = self.states.entry(protocol.to_owned()).or_default();
        let was_enabled = state.enabled;
        state.enabled = true;
        state.listener = Some(listener);
        state.options = options;
        (!was_enabled).then(|| ProtocolChange {
            protocol: protocol.to_owned(),
            enabled: true,
        })
    }

    /// Mark a protocol disabled, returning its listener for teardown and the change, if any.
    pub fn set_disabled(
        &mut self,
        protocol: &str,
    ) -> (Option<ListenerHandle>, Option<ProtocolChange>) {
        let Some(state) = self.states.get_mut(protocol) else {
            return (None, None);
        };
        let was_enabled = state.enabled;
        state.enabled = false;
        let change = was_enabled.then(|| ProtocolChange {
            protocol: protocol.to_owned(),
            enabled: false,
        });
        (state.listener.take(), change)
    }

    pub fn is_enabled(&self, protocol: &str) -> bool {
        self.states.get(protocol).is_some_and(|s| s.enabled)
    }

    pub fn enabled_protocols(&self) -> Vec<String> {
        self.states
            .iter()
            .filter(|(_, s)| s.enabled)
            .map(|(p, _)| p.clone())
            .collect()
    }

    pub fn get(&self, protocol: &str) -> Option<&ProtocolState> {
        self.states.get(protocol)
    }

    /// Disable everything and hand back every listener, for shutdown.
    pub fn take_listeners(&mut self) -> (Vec<(String, ListenerHandle)>, Vec<ProtocolChange>) {
        let names: Vec<String> = self.states.keys().cloned().collect();
        let mut listeners = Vec::new();
        let mut changes = Vec::new();
        for name in names {
            let (listener, change) = self.set_disabled(&name);
            if let Some(l) = listener {
                listeners.push((name, l));
            }
            changes.extend(change);
        }
        (listeners, changes)
    }
}
