//! Quota-header parsing and retry timing for the broker's rate limits.
//!
//! The broker annotates every response with `X-RateLimit-<Dimension>-Remaining`
//! and `X-RateLimit-<Dimension>-Reset` header pairs, one per throttling
//! dimension (per-minute, per-day, per-endpoint, and so on), where the reset
//! value counts seconds until the window replenishes. This module turns those
//! headers into [`QuotaSnapshot`]s, folds snapshots into a shared
//! [`RateTracker`], and computes the delay before the next attempt.

// crates.io
use rand::Rng;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use time::format_description::well_known::Rfc2822;
// self
use crate::{
	_prelude::*,
	config::{RatePolicy, RequestCategory},
};

const HEADER_PREFIX: &str = "x-ratelimit-";
const REMAINING_SUFFIX: &str = "-remaining";
const RESET_SUFFIX: &str = "-reset";

/// Remaining budget and replenish hint for one throttling dimension.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DimensionQuota {
	/// Lower-cased dimension name as it appeared between the header prefix and suffix.
	pub dimension: String,
	/// Calls left in the current window, if the broker reported it.
	pub remaining: Option<u64>,
	/// Time until the window replenishes, if the broker reported it.
	pub reset_in: Option<StdDuration>,
}

/// Quota information extracted from a single response's headers.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QuotaSnapshot {
	/// Per-dimension budgets, in header order.
	pub dimensions: Vec<DimensionQuota>,
	/// Explicit `Retry-After` hint, already converted to a relative duration.
	pub retry_after: Option<StdDuration>,
}
impl QuotaSnapshot {
	/// Extracts quota headers from a response header map.
	///
	/// Unknown dimensions are kept as-is; malformed numeric values are skipped
	/// rather than failing the surrounding request.
	pub fn from_headers(headers: &HeaderMap) -> Self {
		let mut dimensions = Vec::new();

		for (name, value) in headers {
			let name = name.as_str();
			let Some(rest) = name.strip_prefix(HEADER_PREFIX) else {
				continue;
			};
			let Ok(value) = value.to_str() else {
				continue;
			};
			let Ok(value) = value.trim().parse::<u64>() else {
				continue;
			};

			if let Some(dimension) = rest.strip_suffix(REMAINING_SUFFIX) {
				Self::entry(&mut dimensions, dimension).remaining = Some(value);
			} else if let Some(dimension) = rest.strip_suffix(RESET_SUFFIX) {
				Self::entry(&mut dimensions, dimension).reset_in =
					Some(StdDuration::from_secs(value));
			}
		}

		Self { dimensions, retry_after: parse_retry_after(headers) }
	}

	fn entry<'a>(dimensions: &'a mut Vec<DimensionQuota>, name: &str) -> &'a mut DimensionQuota {
		if let Some(i) = dimensions.iter().position(|d| d.dimension == name) {
			&mut dimensions[i]
		} else {
			dimensions.push(DimensionQuota {
				dimension: name.to_owned(),
				remaining: None,
				reset_in: None,
			});

			dimensions.last_mut().expect("Vector cannot be empty right after a push.")
		}
	}

	/// Computes how long to wait before retrying a throttled call.
	///
	/// An explicit `Retry-After` wins. Otherwise the tightest dimension (fewest
	/// remaining calls) that carries a reset hint decides, padded by one second
	/// so the retry lands after the window actually replenishes. Returns `None`
	/// when the response carried no usable hint.
	pub fn retry_delay(&self) -> Option<StdDuration> {
		if let Some(retry_after) = self.retry_after {
			return Some(retry_after);
		}

		self.dimensions
			.iter()
			.filter(|d| d.reset_in.is_some())
			.min_by_key(|d| d.remaining.unwrap_or(0))
			.and_then(|d| d.reset_in)
			.map(|reset| reset + StdDuration::from_secs(1))
	}
}

#[derive(Clone, Debug)]
struct BudgetEntry {
	remaining: u64,
	reset_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct TrackerState {
	budgets: HashMap<String, BudgetEntry>,
	last_dispatch: HashMap<RequestCategory, Instant>,
}
impl TrackerState {
	fn drop_replenished(&mut self, now: Instant) {
		self.budgets.retain(|_, entry| entry.reset_at.is_none_or(|reset_at| reset_at > now));
	}
}

/// Shared view of the broker's quota budgets, fed from response headers.
///
/// Cloning shares the underlying state, matching how the token manager and the
/// requester both observe headers from their own calls.
#[derive(Clone, Debug)]
pub struct RateTracker {
	policy: RatePolicy,
	inner: Arc<Mutex<TrackerState>>,
}
impl RateTracker {
	/// Builds a tracker governed by the provided policy.
	pub fn new(policy: RatePolicy) -> Self {
		Self { policy, inner: Arc::new(Mutex::new(TrackerState::default())) }
	}

	/// Folds a response's quota snapshot into the tracked budgets.
	pub fn observe(&self, snapshot: &QuotaSnapshot) {
		self.observe_at(snapshot, Instant::now())
	}

	/// Folds a snapshot observed at an explicit instant; split out for tests.
	pub fn observe_at(&self, snapshot: &QuotaSnapshot, at: Instant) {
		let mut guard = self.inner.lock();

		for quota in &snapshot.dimensions {
			let Some(remaining) = quota.remaining else {
				continue;
			};

			guard.budgets.insert(quota.dimension.clone(), BudgetEntry {
				remaining,
				reset_at: quota.reset_in.map(|reset| at + reset),
			});
		}
	}

	/// Records a dispatch instant for per-category spacing.
	pub fn mark_dispatch(&self, category: RequestCategory) {
		self.mark_dispatch_at(category, Instant::now())
	}

	fn mark_dispatch_at(&self, category: RequestCategory, at: Instant) {
		self.inner.lock().last_dispatch.insert(category, at);
	}

	/// Computes how long the next dispatch of `category` should wait.
	///
	/// Two constraints are combined and the larger wins: the per-category
	/// minimum spacing, and a low-water advisory that stretches the remaining
	/// reset window across the remaining calls once a dimension drops to or
	/// below the low-water mark. An exhausted dimension yields its entire
	/// remaining window. Zero when neither constraint applies.
	pub fn minimum_delay(&self, category: RequestCategory) -> StdDuration {
		self.minimum_delay_at(category, Instant::now())
	}

	fn minimum_delay_at(&self, category: RequestCategory, now: Instant) -> StdDuration {
		let mut guard = self.inner.lock();

		guard.drop_replenished(now);

		let spacing = guard
			.last_dispatch
			.get(&category)
			.map(|last| self.policy.min_interval(category).saturating_sub(now - *last))
			.unwrap_or_default();
		let advisory = guard
			.budgets
			.values()
			.filter(|entry| entry.remaining <= self.policy.low_water_mark)
			.filter_map(|entry| {
				let window = entry.reset_at?.saturating_duration_since(now);

				if entry.remaining == 0 {
					Some(window)
				} else {
					Some(window / (entry.remaining as u32 + 1))
				}
			})
			.max()
			.unwrap_or_default();

		spacing.max(advisory)
	}

	/// Returns the smallest remaining budget across live dimensions.
	///
	/// Dimensions whose reset instant has passed are treated as replenished and
	/// dropped. `None` means no live observation exists, which callers read as
	/// unconstrained.
	pub fn headroom(&self) -> Option<u64> {
		self.headroom_at(Instant::now())
	}

	fn headroom_at(&self, now: Instant) -> Option<u64> {
		let mut guard = self.inner.lock();

		guard.drop_replenished(now);

		guard.budgets.values().map(|entry| entry.remaining).min()
	}

	/// Returns `true` when the tightest dimension dropped to or below `low_water`.
	pub fn is_low(&self, low_water: u64) -> bool {
		self.headroom().is_some_and(|remaining| remaining <= low_water)
	}

	/// Smallest remaining reset window across live dimensions.
	///
	/// Used as the throttle-retry fallback when a 429 arrives without usable
	/// hints of its own; the caller pads it by one second.
	pub fn tightest_reset(&self) -> Option<StdDuration> {
		self.tightest_reset_at(Instant::now())
	}

	fn tightest_reset_at(&self, now: Instant) -> Option<StdDuration> {
		let mut guard = self.inner.lock();

		guard.drop_replenished(now);

		guard
			.budgets
			.values()
			.filter_map(|entry| entry.reset_at)
			.map(|reset_at| reset_at.saturating_duration_since(now))
			.min()
	}
}

/// Exponential backoff with multiplicative jitter for retries without a broker hint.
#[derive(Clone, Copy, Debug)]
pub struct BackoffPolicy {
	/// Delay before the first retry.
	pub base: StdDuration,
	/// Upper bound applied after doubling.
	pub max: StdDuration,
	/// Jitter factor in `[0, 1)`; the computed delay is scaled by a uniform
	/// sample from `[1 - jitter, 1 + jitter]`.
	pub jitter: f64,
}
impl BackoffPolicy {
	/// Computes the delay before retry number `retry` (1-based).
	pub fn delay_for(&self, retry: u32) -> StdDuration {
		let factor = 1_u32.checked_shl(retry.saturating_sub(1)).unwrap_or(u32::MAX);
		let capped = self.base.saturating_mul(factor).min(self.max);
		let scale = rand::rng().random_range(1. - self.jitter..=1. + self.jitter);

		capped.mul_f64(scale.max(0.))
	}
}

fn parse_retry_after(headers: &HeaderMap) -> Option<StdDuration> {
	let value = headers.get(RETRY_AFTER)?;
	let raw = value.to_str().ok()?.trim();

	if let Ok(secs) = raw.parse::<u64>() {
		return Some(StdDuration::from_secs(secs));
	}
	if let Ok(moment) = OffsetDateTime::parse(raw, &Rfc2822) {
		let delta = moment - OffsetDateTime::now_utc();

		if delta.is_positive() {
			return StdDuration::try_from(delta).ok();
		}
	}

	None
}

#[cfg(test)]
mod tests {
	// crates.io
	use reqwest::header::HeaderValue;
	// self
	use super::*;

	fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
		let mut map = HeaderMap::new();

		for (name, value) in pairs {
			map.append(
				reqwest::header::HeaderName::try_from(*name)
					.expect("Header fixture name should be valid."),
				HeaderValue::from_str(value).expect("Header fixture value should be valid."),
			);
		}

		map
	}

	fn tracker() -> RateTracker {
		RateTracker::new(RatePolicy::default())
	}

	#[test]
	fn snapshot_pairs_remaining_and_reset_by_dimension() {
		let snapshot = QuotaSnapshot::from_headers(&headers(&[
			("x-ratelimit-appday-remaining", "118"),
			("x-ratelimit-appday-reset", "3600"),
			("x-ratelimit-sessionminute-remaining", "0"),
			("x-ratelimit-sessionminute-reset", "12"),
			("x-ratelimit-broken-remaining", "not-a-number"),
			("content-type", "application/json"),
		]));

		assert_eq!(snapshot.dimensions.len(), 2);
		assert_eq!(snapshot.dimensions[0].dimension, "appday");
		assert_eq!(snapshot.dimensions[0].remaining, Some(118));
		assert_eq!(snapshot.dimensions[0].reset_in, Some(StdDuration::from_secs(3600)));
		assert_eq!(snapshot.dimensions[1].dimension, "sessionminute");
		assert_eq!(snapshot.dimensions[1].remaining, Some(0));
	}

	#[test]
	fn retry_after_header_outranks_reset_hints() {
		let snapshot = QuotaSnapshot::from_headers(&headers(&[
			("retry-after", "7"),
			("x-ratelimit-sessionminute-remaining", "0"),
			("x-ratelimit-sessionminute-reset", "55"),
		]));

		assert_eq!(snapshot.retry_delay(), Some(StdDuration::from_secs(7)));
	}

	#[test]
	fn tightest_dimension_decides_and_gets_a_one_second_pad() {
		let snapshot = QuotaSnapshot::from_headers(&headers(&[
			("x-ratelimit-appday-remaining", "118"),
			("x-ratelimit-appday-reset", "3600"),
			("x-ratelimit-sessionminute-remaining", "0"),
			("x-ratelimit-sessionminute-reset", "12"),
		]));

		assert_eq!(snapshot.retry_delay(), Some(StdDuration::from_secs(13)));
	}

	#[test]
	fn no_hint_yields_no_delay() {
		let snapshot = QuotaSnapshot::from_headers(&headers(&[("content-type", "text/plain")]));

		assert_eq!(snapshot.retry_delay(), None);
	}

	#[test]
	fn tracker_reports_the_tightest_live_dimension() {
		let tracker = tracker();
		let now = Instant::now();

		tracker.observe_at(
			&QuotaSnapshot::from_headers(&headers(&[
				("x-ratelimit-appday-remaining", "118"),
				("x-ratelimit-appday-reset", "3600"),
				("x-ratelimit-sessionminute-remaining", "4"),
				("x-ratelimit-sessionminute-reset", "30"),
			])),
			now,
		);

		assert_eq!(tracker.headroom(), Some(4));
		assert!(tracker.is_low(10));
		assert!(!tracker.is_low(3));
	}

	#[test]
	fn tracker_drops_dimensions_past_their_reset() {
		let tracker = tracker();
		// Backdate the observation so the minute window has already replenished.
		let observed = Instant::now() - StdDuration::from_secs(120);

		tracker.observe_at(
			&QuotaSnapshot::from_headers(&headers(&[
				("x-ratelimit-sessionminute-remaining", "0"),
				("x-ratelimit-sessionminute-reset", "30"),
			])),
			observed,
		);

		assert_eq!(tracker.headroom(), None);
		assert!(!tracker.is_low(10));
		assert_eq!(tracker.tightest_reset(), None);
	}

	#[test]
	fn newer_observations_replace_older_ones() {
		let tracker = tracker();
		let now = Instant::now();

		tracker.observe_at(
			&QuotaSnapshot::from_headers(&headers(&[
				("x-ratelimit-sessionminute-remaining", "2"),
				("x-ratelimit-sessionminute-reset", "60"),
			])),
			now,
		);
		tracker.observe_at(
			&QuotaSnapshot::from_headers(&headers(&[
				("x-ratelimit-sessionminute-remaining", "50"),
				("x-ratelimit-sessionminute-reset", "60"),
			])),
			now,
		);

		assert_eq!(tracker.headroom(), Some(50));
	}

	#[test]
	fn minimum_delay_enforces_category_spacing() {
		let tracker = tracker();
		let now = Instant::now();

		tracker.mark_dispatch_at(RequestCategory::Quotes, now);

		let delay = tracker.minimum_delay_at(RequestCategory::Quotes, now + StdDuration::from_secs(2));

		assert!(delay > StdDuration::from_secs(2) && delay <= StdDuration::from_secs(3));
		// Other categories are spaced independently.
		assert_eq!(
			tracker.minimum_delay_at(RequestCategory::Orders, now + StdDuration::from_secs(2)),
			StdDuration::ZERO,
		);
	}

	#[test]
	fn minimum_delay_stretches_a_low_budget_across_its_window() {
		let tracker = tracker();
		let now = Instant::now();

		tracker.observe_at(
			&QuotaSnapshot::from_headers(&headers(&[
				("x-ratelimit-sessionminute-remaining", "4"),
				("x-ratelimit-sessionminute-reset", "50"),
			])),
			now,
		);

		// 50s window split across the 4 remaining calls plus the next one.
		assert_eq!(
			tracker.minimum_delay_at(RequestCategory::Default, now),
			StdDuration::from_secs(10),
		);

		tracker.observe_at(
			&QuotaSnapshot::from_headers(&headers(&[
				("x-ratelimit-sessionminute-remaining", "0"),
				("x-ratelimit-sessionminute-reset", "50"),
			])),
			now,
		);

		// Exhausted dimensions wait out the whole window.
		assert_eq!(
			tracker.minimum_delay_at(RequestCategory::Default, now),
			StdDuration::from_secs(50),
		);
	}

	#[test]
	fn minimum_delay_ignores_dimensions_with_plenty_of_headroom() {
		let tracker = tracker();
		let now = Instant::now();

		tracker.observe_at(
			&QuotaSnapshot::from_headers(&headers(&[
				("x-ratelimit-appday-remaining", "5000"),
				("x-ratelimit-appday-reset", "3600"),
			])),
			now,
		);

		assert_eq!(tracker.minimum_delay_at(RequestCategory::Default, now), StdDuration::ZERO);
	}

	#[test]
	fn tightest_reset_picks_the_soonest_window() {
		let tracker = tracker();
		let now = Instant::now();

		tracker.observe_at(
			&QuotaSnapshot::from_headers(&headers(&[
				("x-ratelimit-appday-remaining", "118"),
				("x-ratelimit-appday-reset", "3600"),
				("x-ratelimit-sessionminute-remaining", "2"),
				("x-ratelimit-sessionminute-reset", "30"),
			])),
			now,
		);

		let tightest =
			tracker.tightest_reset_at(now).expect("Tracker should report a reset window.");

		assert_eq!(tightest, StdDuration::from_secs(30));
	}

	#[test]
	fn backoff_doubles_and_respects_the_cap() {
		let policy = BackoffPolicy {
			base: StdDuration::from_secs(1),
			max: StdDuration::from_secs(5),
			jitter: 0.,
		};

		assert_eq!(policy.delay_for(1), StdDuration::from_secs(1));
		assert_eq!(policy.delay_for(2), StdDuration::from_secs(2));
		assert_eq!(policy.delay_for(3), StdDuration::from_secs(4));
		assert_eq!(policy.delay_for(4), StdDuration::from_secs(5));
		assert_eq!(policy.delay_for(40), StdDuration::from_secs(5));
	}

	#[test]
	fn backoff_jitter_stays_within_its_band() {
		let policy = BackoffPolicy {
			base: StdDuration::from_secs(10),
			max: StdDuration::from_secs(60),
			jitter: 0.2,
		};

		for _ in 0..64 {
			let delay = policy.delay_for(1);

			assert!(delay >= StdDuration::from_secs(8), "{delay:?} fell below the jitter band");
			assert!(delay <= StdDuration::from_secs(12), "{delay:?} exceeded the jitter band");
		}
	}
}
