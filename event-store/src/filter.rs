use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use core_types::codec::{self, EncodingBuffer};
use core_types::event::{ContractEvent, EventType};
use core_types::value::Val;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

pub const MAX_FILTERS: usize = 5;
pub const MAX_CONTRACT_IDS_PER_FILTER: usize = 5;
pub const MAX_TOPICS_PER_FILTER: usize = 5;
pub const MAX_TOPIC_SEGMENTS: usize = 4;

/// Matches one topic segment: either exactly one value, or anything.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SegmentFilter {
    Wildcard,
    Exact(Val),
}

impl SegmentFilter {
    fn matches(&self, segment: &Val) -> bool {
        match self {
            SegmentFilter::Wildcard => true,
            SegmentFilter::Exact(val) => val == segment,
        }
    }
}

impl Serialize for SegmentFilter {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            SegmentFilter::Wildcard => serializer.serialize_str("*"),
            SegmentFilter::Exact(val) => {
                let encoded = BASE64.encode(EncodingBuffer::new().encode_val(val));
                serializer.serialize_str(&encoded)
            }
        }
    }
}

impl<'de> Deserialize<'de> for SegmentFilter {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        if raw == "*" {
            return Ok(SegmentFilter::Wildcard);
        }
        let bytes = BASE64
            .decode(raw.as_bytes())
            .map_err(|_| D::Error::custom("segment filter is neither '*' nor base64"))?;
        let val = codec::decode_val(&bytes)
            .map_err(|err| D::Error::custom(format!("segment filter value: {err}")))?;
        Ok(SegmentFilter::Exact(val))
    }
}

/// An ordered sequence of segment filters. Matches a topic iff the lengths
/// agree and every segment matches pairwise; the empty filter matches only
/// the empty topic.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TopicFilter(pub Vec<SegmentFilter>);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TopicFilterError {
    #[error("topic must have at least one segment")]
    Empty,
    #[error("topic cannot have more than 4 segments")]
    TooManySegments,
}

impl TopicFilter {
    pub fn matches(&self, topic: &[Val]) -> bool {
        self.0.len() == topic.len()
            && self
                .0
                .iter()
                .zip(topic.iter())
                .all(|(segment, val)| segment.matches(val))
    }

    pub fn valid(&self) -> Result<(), TopicFilterError> {
        if self.0.is_empty() {
            return Err(TopicFilterError::Empty);
        }
        if self.0.len() > MAX_TOPIC_SEGMENTS {
            return Err(TopicFilterError::TooManySegments);
        }
        Ok(())
    }
}

/// One disjunct of a getEvents request: all present conditions must hold
/// for an event to pass.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EventFilter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    #[serde(rename = "contractIds", skip_serializing_if = "Vec::is_empty")]
    pub contract_ids: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub topics: Vec<TopicFilter>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FilterError {
    #[error("if set, type must be either 'system' or 'contract'")]
    BadEventType,
    #[error("maximum 5 contract IDs per filter")]
    TooManyContractIds,
    #[error("contract ID {index} invalid")]
    BadContractId { index: usize },
    #[error("maximum 5 topics per filter")]
    TooManyTopics,
    #[error("topic {index} invalid: {source}")]
    BadTopic {
        index: usize,
        source: TopicFilterError,
    },
}

impl EventFilter {
    pub fn valid(&self) -> Result<(), FilterError> {
        if let Some(event_type) = &self.event_type {
            if event_type.parse::<EventType>().is_err() {
                return Err(FilterError::BadEventType);
            }
        }
        if self.contract_ids.len() > MAX_CONTRACT_IDS_PER_FILTER {
            return Err(FilterError::TooManyContractIds);
        }
        for (i, id) in self.contract_ids.iter().enumerate() {
            if id.len() != 64 || hex::decode(id).is_err() {
                return Err(FilterError::BadContractId { index: i + 1 });
            }
        }
        if self.topics.len() > MAX_TOPICS_PER_FILTER {
            return Err(FilterError::TooManyTopics);
        }
        for (i, topic) in self.topics.iter().enumerate() {
            topic.valid().map_err(|source| FilterError::BadTopic {
                index: i + 1,
                source,
            })?;
        }
        Ok(())
    }

    pub fn matches(&self, event: &ContractEvent) -> bool {
        self.matches_event_type(event)
            && self.matches_contract_ids(event)
            && self.matches_topics(event)
    }

    fn matches_event_type(&self, event: &ContractEvent) -> bool {
        match &self.event_type {
            None => true,
            Some(wanted) => wanted == event.event_type.as_str(),
        }
    }

    fn matches_contract_ids(&self, event: &ContractEvent) -> bool {
        if self.contract_ids.is_empty() {
            return true;
        }
        let Some(id) = &event.contract_id else {
            return false;
        };
        let needle = id.to_hex();
        self.contract_ids.iter().any(|candidate| *candidate == needle)
    }

    fn matches_topics(&self, event: &ContractEvent) -> bool {
        if self.topics.is_empty() {
            return true;
        }
        self.topics
            .iter()
            .any(|filter| filter.matches(&event.topics))
    }
}
