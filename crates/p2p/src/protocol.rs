use libp2p::StreamProtocol;
use std::{collections::HashSet, hash::Hash};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Protocol {
    // any -> provider
    Inference,
}

impl Protocol {
    pub(crate) fn as_stream_protocol(&self) -> StreamProtocol {
        match self {
            Protocol::Inference => StreamProtocol::new("/provider-node/inference/1.0.0"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Protocols(HashSet<Protocol>);

impl Default for Protocols {
    fn default() -> Self {
        Self::new()
    }
}

impl Protocols {
    pub fn new() -> Self {
        Self(HashSet::new())
    }

    pub fn has_inference(&self) -> bool {
        self.0.contains(&Protocol::Inference)
    }

    pub fn with_inference(mut self) -> Self {
        self.0.insert(Protocol::Inference);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl IntoIterator for Protocols {
    type Item = Protocol;
    type IntoIter = std::collections::hash_set::IntoIter<Protocol>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}
