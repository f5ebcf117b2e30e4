//! Deduplicated, filterable catalogue of discovered peers.
//!
//! Every accepted sample is retained by identity in discovery order. Filters
//! only decide what is exported; changing them never drops history. Matching
//! uses per-peer sticky attributes (strongest RSSI ever seen, every service
//! ever advertised) so a peer that once passed a filter stays visible when it
//! drifts away or changes its advertising packet.

use crate::identity::PeerIdentity;
use crate::sample::SignalSample;
use crate::service_uuid::ServiceUuid;
use log::debug;
use std::collections::HashMap;

/// RSSI at or above which a peer counts as nearby (dBm).
pub const DEFAULT_NEARBY_RSSI: i16 = -50;

/// User-selectable inclusion rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterCriteria {
    /// Only export peers advertising a known service
    pub require_known_service: bool,
    /// Only export peers that were at some point seen at or above the nearby threshold
    pub nearby_only: bool,
}

impl Default for FilterCriteria {
    fn default() -> Self {
        Self {
            require_known_service: true,
            nearby_only: false,
        }
    }
}

/// What "known service" and "nearby" mean for this registry.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchRules {
    /// Services that count as known. Empty means any advertised service.
    pub known_services: Vec<ServiceUuid>,
    /// Nearby threshold in dBm
    pub nearby_rssi: i16,
}

impl Default for MatchRules {
    fn default() -> Self {
        Self {
            known_services: Vec::new(),
            nearby_rssi: DEFAULT_NEARBY_RSSI,
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    latest: SignalSample,
    highest_rssi: i16,
    services: Vec<ServiceUuid>,
}

impl Entry {
    fn new(sample: SignalSample) -> Self {
        Self {
            highest_rssi: sample.rssi,
            services: sample.service_uuids.clone(),
            latest: sample,
        }
    }

    /// Arrival order decides which sample is latest. The retained timestamp
    /// never moves backwards, even when the wall clock does.
    fn update(&mut self, mut sample: SignalSample) {
        if sample.observed_at < self.latest.observed_at {
            debug!("clock stepped back for {}, keeping last timestamp", sample.identity());
            sample.observed_at = self.latest.observed_at;
        }
        self.highest_rssi = self.highest_rssi.max(sample.rssi);
        for uuid in &sample.service_uuids {
            if !self.services.contains(uuid) {
                self.services.push(*uuid);
            }
        }
        self.latest = sample;
    }
}

/// Rolling set of peers keyed by identity.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    entries: Vec<Entry>,
    index: HashMap<PeerIdentity, usize>,
    criteria: FilterCriteria,
    rules: MatchRules,
}

impl PeerRegistry {
    pub fn new(criteria: FilterCriteria, rules: MatchRules) -> Self {
        Self {
            entries: Vec::new(),
            index: HashMap::new(),
            criteria,
            rules,
        }
    }

    /// Record a sample, replacing any earlier one for the same identity.
    ///
    /// Samples are applied in arrival order. Returns whether the peer's entry
    /// is accepted by the current filters after the update.
    pub fn observe(&mut self, sample: SignalSample) -> bool {
        match self.index.get(sample.identity()) {
            Some(&pos) => {
                self.entries[pos].update(sample);
                self.matches(&self.entries[pos])
            }
            None => {
                self.index
                    .insert(sample.identity().clone(), self.entries.len());
                self.entries.push(Entry::new(sample));
                self.matches(&self.entries[self.entries.len() - 1])
            }
        }
    }

    /// Replace the filter criteria. Returns whether any retained peer now matches.
    pub fn apply_filters(&mut self, criteria: FilterCriteria) -> bool {
        self.criteria = criteria;
        self.has_matches()
    }

    pub fn set_require_known_service(&mut self, required: bool) -> bool {
        self.apply_filters(FilterCriteria {
            require_known_service: required,
            ..self.criteria
        })
    }

    pub fn set_nearby_only(&mut self, nearby_only: bool) -> bool {
        self.apply_filters(FilterCriteria {
            nearby_only,
            ..self.criteria
        })
    }

    /// Latest samples of all peers accepted by the current filters, in discovery order.
    pub fn export_snapshot(&self) -> Vec<SignalSample> {
        self.entries
            .iter()
            .filter(|e| self.matches(e))
            .map(|e| e.latest.clone())
            .collect()
    }

    pub fn has_matches(&self) -> bool {
        self.entries.iter().any(|e| self.matches(e))
    }

    /// Forget every peer. Filters and rules are kept.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
    }

    pub fn get(&self, identity: &PeerIdentity) -> Option<&SignalSample> {
        self.index.get(identity).map(|&pos| &self.entries[pos].latest)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn criteria(&self) -> FilterCriteria {
        self.criteria
    }

    pub fn rules(&self) -> &MatchRules {
        &self.rules
    }

    fn matches(&self, entry: &Entry) -> bool {
        self.matches_service(entry) && self.matches_nearby(entry)
    }

    fn matches_service(&self, entry: &Entry) -> bool {
        if !self.criteria.require_known_service {
            return true;
        }
        if self.rules.known_services.is_empty() {
            return !entry.services.is_empty();
        }
        entry
            .services
            .iter()
            .any(|uuid| self.rules.known_services.contains(uuid))
    }

    fn matches_nearby(&self, entry: &Entry) -> bool {
        !self.criteria.nearby_only || entry.highest_rssi >= self.rules.nearby_rssi
    }
}
