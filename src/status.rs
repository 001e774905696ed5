//! Server capacity snapshots.
//!
//! The status endpoint answers with a short plain-text report: the number of
//! query slots per client, how many are open, when the next one frees up,
//! and which queries are running. [`Status`] is the parsed form of it.

use regex::Regex;
use std::fmt;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::time::Instant;

/// Information about the service's rate limit for this client.
///
/// A `Status` is a snapshot: it is parsed from a single probe and is never
/// refreshed in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    /// The announced endpoint behind a load balancer, or the identity the
    /// service saw us connect as.
    pub endpoint: Option<String>,

    /// The maximum number of concurrent queries per client, or `None` if
    /// there is no rate limit.
    pub slots: Option<u32>,

    /// The number of slots currently open for this client, or `None` if
    /// there is no rate limit.
    pub free_slots: Option<u32>,

    /// How long until a slot opens for this client (zero if one is open).
    pub cooldown: Duration,

    /// When the cooldown ends, or `None` if there is no cooldown.
    pub cooldown_until: Option<Instant>,

    /// The number of queries the service is running for this client.
    pub nb_running_queries: u32,

    /// The concurrency limit the client should use: the server's slot count,
    /// capped by the client's own setting.
    pub concurrency: usize,
}

impl Status {
    /// Parses a status report.
    ///
    /// `max_concurrency` is the client's own limit; `now` anchors
    /// `cooldown_until`. Returns `None` if the report lacks a rate limit line.
    ///
    /// # Examples
    ///
    /// ```
    /// use overpass_engine::Status;
    /// use std::time::Duration;
    ///
    /// let report = "Connected as: 1807920285\n\
    ///               Current time: 2020-11-21T12:45:45Z\n\
    ///               Rate limit: 2\n\
    ///               Slot available after: 2020-11-21T12:46:05Z, in 20 seconds.\n\
    ///               Slot available after: 2020-11-21T12:50:26Z, in 281 seconds.\n\
    ///               Currently running queries (pid, space limit, time limit, start time):\n";
    ///
    /// let status = Status::parse(report, 32, tokio::time::Instant::now()).unwrap();
    /// assert_eq!(status.slots, Some(2));
    /// assert_eq!(status.free_slots, Some(0));
    /// assert_eq!(status.cooldown, Duration::from_secs(20));
    /// assert_eq!(status.concurrency, 2);
    /// ```
    pub fn parse(text: &str, max_concurrency: usize, now: Instant) -> Option<Status> {
        let patterns = patterns();

        let slots: u32 = patterns
            .rate_limit
            .captures(text)?
            .get(1)?
            .as_str()
            .parse()
            .ok()?;
        let slots = (slots > 0).then_some(slots);

        let mut free_slots = None;
        let mut cooldown = Duration::ZERO;
        let mut concurrency = max_concurrency;

        if let Some(slots) = slots {
            let cooldowns: Vec<u64> = patterns
                .cooldown
                .captures_iter(text)
                .filter_map(|c| c.get(1)?.as_str().parse().ok())
                .collect();

            let free = patterns
                .available
                .captures(text)
                .and_then(|c| c.get(1)?.as_str().parse().ok())
                .unwrap_or_else(|| slots.saturating_sub(cooldowns.len() as u32));

            if free == 0 {
                cooldown = Duration::from_secs(cooldowns.iter().copied().min().unwrap_or(0));
            }

            free_slots = Some(free);
            concurrency = max_concurrency.min(slots as usize);
        }

        let endpoint = patterns
            .announced
            .captures(text)
            .or_else(|| patterns.connected.captures(text))
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string());

        let cooldown_until = (!cooldown.is_zero()).then(|| now + cooldown);

        Some(Status {
            endpoint,
            slots,
            free_slots,
            cooldown,
            cooldown_until,
            nb_running_queries: count_running_queries(text),
            concurrency,
        })
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.free_slots, self.slots) {
            (Some(free), Some(slots)) => write!(
                f,
                "Status(slots={}/{}, cooldown={}s)",
                free,
                slots,
                self.cooldown.as_secs()
            ),
            _ => write!(f, "Status(slots=unlimited, cooldown={}s)", self.cooldown.as_secs()),
        }
    }
}

/// Counts the table rows below the "Currently running queries" header.
fn count_running_queries(text: &str) -> u32 {
    text.lines()
        .skip_while(|line| !line.contains("Currently running queries"))
        .skip(1)
        .filter(|line| {
            line.split_whitespace()
                .next()
                .is_some_and(|pid| pid.parse::<u64>().is_ok())
        })
        .count() as u32
}

struct Patterns {
    rate_limit: Regex,
    available: Regex,
    cooldown: Regex,
    announced: Regex,
    connected: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        rate_limit: Regex::new(r"Rate limit: (\d+)").expect("valid regex"),
        available: Regex::new(r"(\d+) slots available now").expect("valid regex"),
        cooldown: Regex::new(r"Slot available after: .+, in (\d+) seconds").expect("valid regex"),
        announced: Regex::new(r"Announced endpoint: (\S+)").expect("valid regex"),
        connected: Regex::new(r"Connected as: (\S+)").expect("valid regex"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Status {
        Status::parse(text, 32, Instant::now()).unwrap()
    }

    #[test]
    fn test_idle() {
        let status = parse(
            "Connected as: 1807920285\n\
             Current time: 2020-07-10T14:56:19Z\n\
             Rate limit: 2\n\
             2 slots available now.\n\
             Currently running queries (pid, space limit, time limit, start time):\n",
        );

        assert_eq!(status.endpoint.as_deref(), Some("1807920285"));
        assert_eq!(status.slots, Some(2));
        assert_eq!(status.free_slots, Some(2));
        assert_eq!(status.cooldown, Duration::ZERO);
        assert_eq!(status.cooldown_until, None);
        assert_eq!(status.nb_running_queries, 0);
        assert_eq!(status.concurrency, 2);
    }

    #[test]
    fn test_announced_endpoint_wins() {
        let status = parse(
            "Connected as: 2185740403\n\
             Current time: 2023-06-22T21:51:45Z\n\
             Announced endpoint: gall.openstreetmap.de/\n\
             Rate limit: 6\n\
             6 slots available now.\n\
             Currently running queries (pid, space limit, time limit, start time):\n",
        );

        assert_eq!(status.endpoint.as_deref(), Some("gall.openstreetmap.de/"));
        assert_eq!(status.concurrency, 6);
    }

    #[test]
    fn test_one_slot_taken() {
        let status = parse(
            "Connected as: 1807920285\n\
             Current time: 2020-11-21T12:45:33Z\n\
             Rate limit: 2\n\
             Slot available after: 2020-11-21T12:50:26Z, in 293 seconds.\n\
             Currently running queries (pid, space limit, time limit, start time):\n\
             28314\t536870912\t60\t2020-11-21T12:45:27Z\n",
        );

        assert_eq!(status.free_slots, Some(1));
        assert_eq!(status.cooldown, Duration::ZERO);
        assert_eq!(status.nb_running_queries, 1);
    }

    #[test]
    fn test_no_slot_available() {
        let now = Instant::now();
        let status = Status::parse(
            "Rate limit: 2\n\
             Slot available after: 2020-11-21T12:46:05Z, in 20 seconds.\n\
             Slot available after: 2020-11-21T12:50:26Z, in 281 seconds.\n\
             Currently running queries (pid, space limit, time limit, start time):\n",
            32,
            now,
        )
        .unwrap();

        assert_eq!(status.free_slots, Some(0));
        assert_eq!(status.cooldown, Duration::from_secs(20));
        assert_eq!(status.cooldown_until, Some(now + Duration::from_secs(20)));
        assert_eq!(status.to_string(), "Status(slots=0/2, cooldown=20s)");
    }

    #[test]
    fn test_unlimited_and_client_cap() {
        let status = Status::parse("Rate limit: 0\n", 4, Instant::now()).unwrap();
        assert_eq!(status.slots, None);
        assert_eq!(status.free_slots, None);
        assert_eq!(status.concurrency, 4);

        let status = Status::parse("Rate limit: 8\n8 slots available now.\n", 4, Instant::now())
            .unwrap();
        assert_eq!(status.concurrency, 4);
    }

    #[test]
    fn test_missing_rate_limit() {
        assert!(Status::parse("<html>maintenance</html>", 32, Instant::now()).is_none());
    }
}
