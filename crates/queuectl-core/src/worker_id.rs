//! Unique worker-identity generation (`spec.md` §2.2, §4.8).

/// Build a worker identity of the form `host-pid-index-random`.
///
/// `index` is the worker's position within its pool (0-based); `random` is a
/// 4-hex-character suffix so two pools started on the same host in the same
/// process (tests spawning several supervisors) never collide.
pub fn generate_worker_id(index: usize) -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown-host".to_string());
    let pid = std::process::id();
    let suffix: String = (0..4)
        .map(|_| char::from_digit(fastrand::u32(0..16), 16).unwrap())
        .collect();
    format!("{host}-{pid}-{index}-{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distinct_indices_produce_distinct_ids_with_high_probability() {
        let a = generate_worker_id(0);
        let b = generate_worker_id(1);
        assert_ne!(a, b);
        assert!(a.ends_with(&format!("-0-{}", &a[a.len() - 4..])));
    }

    #[test]
    fn id_has_four_dash_separated_segments() {
        let id = generate_worker_id(3);
        // host-pid-index-random: host may itself contain no dashes on most
        // hosts, but we only assert the tail structure we control.
        let tail: Vec<&str> = id.rsplitn(3, '-').collect();
        assert_eq!(tail.len(), 3);
        assert_eq!(tail[1], "3");
        assert_eq!(tail[0].len(), 4);
    }
}
