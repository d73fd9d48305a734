//! Adaptive media scoring.
//!
//! Each (peer, media) pair gets a score in [-100, 100] from two terms:
//!
//! - **Length suitability**: 0 inside the media's efficient payload envelope,
//!   falling linearly (scaled by the media's penalty rate) as the payload gets
//!   smaller or larger, floored at -100.
//! - **Reliability**: the failure rate since the last score is pushed into the
//!   peer's rolling history; the term is `10 - 100 * average`, floored at -100.
//!
//! The sum is clamped, averaged with the previous score when there is one, and
//! the outcome counters are reset. The history, not the counters, carries
//! long-term memory.

use std::sync::Arc;

use sdp_transport::{MediaMask, MediaType};
use tracing::{debug, trace};

use crate::clock::Clock;
use crate::peer::{MediaStats, Peer};

/// Constant added to the reliability term
pub const RELIABILITY_BIAS: f32 = 10.0;

/// Lowest possible score
pub const MIN_SCORE: f32 = -100.0;

/// Highest possible score
pub const MAX_SCORE: f32 = 100.0;

/// Payload envelope and capacity of one media
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MediaProfile {
    /// Smallest payload carried without overhead penalty
    pub ideal_min: usize,
    /// Largest payload carried without fragmentation penalty
    pub ideal_max: usize,
    /// Penalty slope outside the envelope
    pub penalty_rate: f32,
    /// Nominal throughput (bytes/s)
    pub theoretical_bps: u32,
}

impl MediaProfile {
    /// Built-in profile for `media`
    pub const fn for_media(media: MediaType) -> Self {
        match media {
            MediaType::RadioShort => Self::new(8, 200, 0.5, 125_000),
            MediaType::RadioMesh => Self::new(16, 1024, 0.4, 50_000),
            MediaType::RadioLong => Self::new(4, 64, 1.0, 700),
            MediaType::Cellular => Self::new(256, 4096, 0.3, 1_000_000),
            MediaType::BusI2c => Self::new(2, 32, 0.8, 50_000),
            MediaType::BusCan => Self::new(1, 8, 1.5, 125_000),
            MediaType::BusTtl => Self::new(16, 1024, 0.3, 11_520),
        }
    }

    const fn new(ideal_min: usize, ideal_max: usize, penalty_rate: f32, theoretical_bps: u32) -> Self {
        Self {
            ideal_min,
            ideal_max,
            penalty_rate,
            theoretical_bps,
        }
    }
}

/// Fitness of a payload length for a media, in [-100, 0].
pub fn length_suitability(len: usize, profile: &MediaProfile) -> f32 {
    let len = len as f32;
    let min = profile.ideal_min as f32;
    let max = profile.ideal_max as f32;
    let rate = profile.penalty_rate.max(0.0);

    let penalty = if len < min {
        rate * 100.0 * (min - len) / min.max(1.0)
    } else if len > max {
        rate * 100.0 * (len - max) / max.max(1.0)
    } else {
        0.0
    };

    -penalty.min(100.0)
}

/// Push the current failure rate and return the reliability term.
pub fn reliability(stats: &mut MediaStats) -> f32 {
    stats.push_failure_rate(stats.current_failure_rate());
    (RELIABILITY_BIAS - 100.0 * stats.average_failure_rate()).max(MIN_SCORE)
}

/// Score one media's statistics for a payload of `len` bytes.
///
/// Mutates `stats`: history grows, counters reset, last score stamped.
pub fn score(stats: &mut MediaStats, profile: &MediaProfile, len: usize, now_us: u64) -> f32 {
    let computed = (length_suitability(len, profile) + reliability(stats)).clamp(MIN_SCORE, MAX_SCORE);
    let smoothed = match stats.last_score {
        Some(previous) => (computed + previous) / 2.0,
        None => computed,
    };

    stats.last_score = Some(smoothed);
    stats.last_score_us = now_us;
    stats.reset_counters();
    smoothed
}

/// Picks the transport for each outbound message
pub struct MediaScorer {
    clock: Arc<dyn Clock>,
    profiles: [MediaProfile; 7],
}

impl MediaScorer {
    /// Scorer with the built-in profiles
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            profiles: MediaType::ALL.map(MediaProfile::for_media),
        }
    }

    /// Replace the profile of one media
    #[must_use]
    pub fn with_profile(mut self, media: MediaType, profile: MediaProfile) -> Self {
        self.profiles[index(media)] = profile;
        self
    }

    /// Profile in use for `media`
    pub fn profile(&self, media: MediaType) -> &MediaProfile {
        &self.profiles[index(media)]
    }

    /// Score `media` for `peer`; `None` if the peer lacks that media.
    pub fn score(&self, peer: &mut Peer, media: MediaType, len: usize) -> Option<f32> {
        let now = self.clock.now_us();
        let profile = self.profiles[index(media)];
        let stats = peer.stats_mut(media)?;
        let s = score(stats, &profile, len, now);
        trace!("Peer {} {} len {} scored {:.1}", peer.handle(), media, len, s);
        Some(s)
    }

    /// Best media shared by `peer` and `local` for a `len`-byte payload.
    /// Ties go to the higher-priority media.
    pub fn select_media(&self, peer: &mut Peer, len: usize, local: MediaMask) -> Option<MediaType> {
        let mut best: Option<(MediaType, f32)> = None;

        for media in peer.media().intersection(local).iter() {
            let Some(s) = self.score(peer, media, len) else {
                continue;
            };
            best = match best {
                Some((m, b)) if b > s || (b == s && m.priority() > media.priority()) => Some((m, b)),
                _ => Some((media, s)),
            };
        }

        if let Some((media, s)) = best {
            debug!("Selected {} for peer {} ({} bytes, score {:.1})", media, peer.handle(), len, s);
        }
        best.map(|(m, _)| m)
    }
}

const fn index(media: MediaType) -> usize {
    media.bit().trailing_zeros() as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::peer::PeerStore;
    use sdp_transport::MacAddress;

    fn profile(min: usize, max: usize, rate: f32) -> MediaProfile {
        MediaProfile {
            ideal_min: min,
            ideal_max: max,
            penalty_rate: rate,
            theoretical_bps: 0,
        }
    }

    #[test]
    fn test_length_inside_envelope_is_zero() {
        let p = profile(10, 100, 1.0);
        assert_eq!(length_suitability(10, &p), 0.0);
        assert_eq!(length_suitability(50, &p), 0.0);
        assert_eq!(length_suitability(100, &p), 0.0);
    }

    #[test]
    fn test_length_penalties() {
        let p = profile(10, 100, 1.0);
        assert_eq!(length_suitability(5, &p), -50.0);
        assert_eq!(length_suitability(150, &p), -50.0);
        assert_eq!(length_suitability(0, &p), -100.0);
        assert_eq!(length_suitability(10_000, &p), -100.0);
    }

    #[test]
    fn test_fresh_stats_score_on_length_only() {
        let p = profile(10, 100, 1.0);
        let mut stats = MediaStats::new(0);
        // no attempts: reliability is the bias alone
        let s = score(&mut stats, &p, 150, 42);
        assert_eq!(s, -50.0 + RELIABILITY_BIAS);
        assert_eq!(stats.last_score, Some(s));
        assert_eq!(stats.last_score_us, 42);
    }

    #[test]
    fn test_ten_failures_drive_score_down() {
        let p = profile(1, 1000, 1.0);
        let mut stats = MediaStats::new(0);
        stats.send_fail = 10;
        let s = score(&mut stats, &p, 100, 0);
        assert!((stats.average_failure_rate() - 1.0).abs() < f32::EPSILON);
        assert!(s <= -90.0);
        assert_eq!(stats.failures(), 0);
    }

    #[test]
    fn test_smoothing_with_previous() {
        let p = profile(1, 1000, 1.0);
        let mut stats = MediaStats::new(0);
        let first = score(&mut stats, &p, 100, 0);
        assert_eq!(first, 10.0);

        stats.send_fail = 1;
        // history [0, 1] -> avg 0.5 -> 10 - 50 = -40, smoothed with 10
        let second = score(&mut stats, &p, 100, 1);
        assert_eq!(second, (-40.0 + 10.0) / 2.0);
    }

    #[test]
    fn test_select_prefers_clean_media() {
        let clock = Arc::new(ManualClock::new(0));
        let scorer = MediaScorer::new(clock);
        let store = PeerStore::new(MacAddress([2, 0, 0, 0, 0, 1]), 2);
        let mask: MediaMask = [MediaType::RadioShort, MediaType::RadioLong].into_iter().collect();
        let h = store.add("alpha", MacAddress([2, 0, 0, 0, 0, 2]), mask).unwrap();

        let chosen = store
            .with_peer_mut(h, |p| {
                p.stats_mut(MediaType::RadioShort).unwrap().send_fail = 10;
                scorer.select_media(p, 32, mask)
            })
            .unwrap();
        assert_eq!(chosen, Some(MediaType::RadioLong));
    }

    #[test]
    fn test_select_tie_goes_to_priority() {
        let scorer = MediaScorer::new(Arc::new(ManualClock::new(0)))
            .with_profile(MediaType::BusCan, profile(1, 100, 1.0))
            .with_profile(MediaType::RadioShort, profile(1, 100, 1.0));
        let store = PeerStore::new(MacAddress([2, 0, 0, 0, 0, 1]), 2);
        let mask: MediaMask = [MediaType::RadioShort, MediaType::BusCan].into_iter().collect();
        let h = store.add("alpha", MacAddress([2, 0, 0, 0, 0, 2]), mask).unwrap();

        let chosen = store.with_peer_mut(h, |p| scorer.select_media(p, 16, mask)).unwrap();
        assert_eq!(chosen, Some(MediaType::BusCan));
    }

    #[test]
    fn test_select_without_common_media() {
        let scorer = MediaScorer::new(Arc::new(ManualClock::new(0)));
        let store = PeerStore::new(MacAddress([2, 0, 0, 0, 0, 1]), 2);
        let h = store
            .add("alpha", MacAddress([2, 0, 0, 0, 0, 2]), MediaType::BusCan.into())
            .unwrap();
        let chosen = store
            .with_peer_mut(h, |p| scorer.select_media(p, 16, MediaType::RadioLong.into()))
            .unwrap();
        assert_eq!(chosen, None);
    }
}
