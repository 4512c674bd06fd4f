use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use tracing::{debug, warn};

use super::error::TrackerError;
use super::response::{AnnounceRequest, AnnounceResponse};
use super::udp::UdpTracker;
use crate::config::TrackerConfig;

/// Outcome of one walk down the announce-list.
#[derive(Debug, Default)]
pub struct AnnounceRound {
    /// The first tracker that answered, with its reply.
    pub response: Option<(String, AnnounceResponse)>,
    /// Every tracker tried before it, with the reason it was passed over.
    pub failures: Vec<(String, TrackerError)>,
}

/// Announces to an ordered list of trackers, falling back down the list.
///
/// All randomness (transaction ids, announce keys) comes from the generator
/// passed to [`TrackerClient::new`]; each tracker gets its own generator
/// seeded from it.
pub struct TrackerClient<R = StdRng> {
    urls: Vec<String>,
    config: TrackerConfig,
    rng: R,
    trackers: HashMap<String, UdpTracker<StdRng>>,
}

impl<R: RngCore> TrackerClient<R> {
    pub fn new(urls: Vec<String>, config: TrackerConfig, rng: R) -> Self {
        Self {
            urls,
            config,
            rng,
            trackers: HashMap::new(),
        }
    }

    pub fn urls(&self) -> &[String] {
        &self.urls
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Tries each tracker in order until one answers.
    ///
    /// Trackers that are not `udp://` are skipped and reported as
    /// [`TrackerError::UnsupportedProtocol`].
    pub async fn announce(&mut self, request: &AnnounceRequest) -> AnnounceRound {
        let mut round = AnnounceRound::default();
        let urls = self.urls.clone();

        for url in urls {
            if !url.starts_with("udp://") {
                debug!(tracker = %url, "skipping non-udp tracker");
                round
                    .failures
                    .push((url.clone(), TrackerError::UnsupportedProtocol(url)));
                continue;
            }

            match self.announce_one(&url, request).await {
                Ok(response) => {
                    round.response = Some((url, response));
                    break;
                }
                Err(e) => {
                    warn!(tracker = %url, error = %e, "announce failed");
                    round.failures.push((url, e));
                }
            }
        }

        if round.response.is_none() && round.failures.is_empty() {
            round
                .failures
                .push((String::new(), TrackerError::NoTrackers));
        }
        round
    }

    async fn announce_one(
        &mut self,
        url: &str,
        request: &AnnounceRequest,
    ) -> Result<AnnounceResponse, TrackerError> {
        if !self.trackers.contains_key(url) {
            let rng = StdRng::from_rng(&mut self.rng);
            let tracker = UdpTracker::bind(url, &self.config, rng).await?;
            self.trackers.insert(url.to_string(), tracker);
        }
        let Some(tracker) = self.trackers.get_mut(url) else {
            return Err(TrackerError::NoTrackers);
        };

        let result = tracker.announce(request).await;
        if result.is_err() {
            // A fresh socket next time.
            self.trackers.remove(url);
        }
        result
    }
}
