use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Mutex;

use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use std::collections::HashMap;

/// Decisions cached per destination address are flushed in bulk once the map
/// grows past this bound.
pub const CACHE_FLUSH_THRESHOLD: usize = 65_535;

/// An ordered, non-overlapping set of CIDR ranges with binary-search
/// membership. Construction sorts and merges whatever it is given.
#[derive(Debug, Clone, Default)]
pub struct IpRangeFilter {
    v4: Vec<Ipv4Net>,
    v6: Vec<Ipv6Net>,
}

impl IpRangeFilter {
    pub fn new(ranges: impl IntoIterator<Item = IpNet>) -> Self {
        let mut v4 = Vec::new();
        let mut v6 = Vec::new();
        for r in ranges {
            match r {
                IpNet::V4(n) => v4.push(n),
                IpNet::V6(n) => v6.push(n),
            }
        }
        // Aggregation yields a sorted, non-overlapping canonical list.
        let v4 = Ipv4Net::aggregate(&v4);
        let v6 = Ipv6Net::aggregate(&v6);
        Self { v4, v6 }
    }

    /// Matches everything; the filter a session gets when the server sends
    /// no `include_ip_ranges`.
    pub fn all() -> Self {
        Self::new([
            IpNet::V4(Ipv4Net::new(Ipv4Addr::UNSPECIFIED, 0).expect("valid /0")),
            IpNet::V6(Ipv6Net::new(Ipv6Addr::UNSPECIFIED, 0).expect("valid /0")),
        ])
    }

    pub fn is_empty(&self) -> bool {
        self.v4.is_empty() && self.v6.is_empty()
    }

    pub fn len(&self) -> usize {
        self.v4.len() + self.v6.len()
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        match ip {
            IpAddr::V4(ip) => {
                // Last range whose network address is <= ip.
                let idx = self.v4.partition_point(|n| n.network() <= ip);
                idx > 0 && self.v4[idx - 1].contains(&ip)
            }
            IpAddr::V6(ip) => {
                let idx = self.v6.partition_point(|n| n.network() <= ip);
                idx > 0 && self.v6[idx - 1].contains(&ip)
            }
        }
    }

    pub fn ranges(&self) -> Vec<IpNet> {
        self.v4
            .iter()
            .copied()
            .map(IpNet::V4)
            .chain(self.v6.iter().copied().map(IpNet::V6))
            .collect()
    }
}

/// [`IpRangeFilter`] plus a per-address decision cache.
///
/// Dispatch asks the same destinations over and over; the cache keeps the
/// binary search off the per-packet path and flushes in bulk past
/// [`CACHE_FLUSH_THRESHOLD`] entries.
#[derive(Debug, Default)]
pub struct CachedIpRangeFilter {
    filter: IpRangeFilter,
    cache: Mutex<HashMap<IpAddr, bool>>,
}

impl CachedIpRangeFilter {
    pub fn new(filter: IpRangeFilter) -> Self {
        Self {
            filter,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn filter(&self) -> &IpRangeFilter {
        &self.filter
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        let mut cache = self.cache.lock().expect("ip range cache poisoned");
        if let Some(hit) = cache.get(&ip) {
            return *hit;
        }
        let verdict = self.filter.contains(ip);
        if cache.len() >= CACHE_FLUSH_THRESHOLD {
            cache.clear();
        }
        cache.insert(ip, verdict);
        verdict
    }

    #[cfg(test)]
    fn cached_len(&self) -> usize {
        self.cache.lock().expect("ip range cache poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(ranges: &[&str]) -> IpRangeFilter {
        IpRangeFilter::new(ranges.iter().map(|r| r.parse::<IpNet>().unwrap()))
    }

    #[test]
    fn membership_matches_linear_scan() {
        let ranges = [
            "10.0.0.0/8",
            "172.16.0.0/12",
            "192.168.1.0/24",
            "fd00::/8",
        ];
        let f = filter(&ranges);
        let nets: Vec<IpNet> = ranges.iter().map(|r| r.parse().unwrap()).collect();

        let probes: [IpAddr; 8] = [
            "10.1.2.3".parse().unwrap(),
            "11.0.0.1".parse().unwrap(),
            "172.16.0.1".parse().unwrap(),
            "172.32.0.1".parse().unwrap(),
            "192.168.1.77".parse().unwrap(),
            "192.168.2.1".parse().unwrap(),
            "fd12::9".parse().unwrap(),
            "2001:db8::1".parse().unwrap(),
        ];
        for ip in probes {
            let linear = nets.iter().any(|n| n.contains(&ip));
            assert_eq!(f.contains(ip), linear, "probe {ip}");
        }
    }

    #[test]
    fn overlapping_input_is_merged() {
        let f = filter(&["10.0.0.0/8", "10.1.0.0/16", "10.0.0.0/9"]);
        assert_eq!(f.len(), 1);
        assert!(f.contains("10.200.0.1".parse().unwrap()));
    }

    #[test]
    fn all_matches_both_families() {
        let f = IpRangeFilter::all();
        assert!(f.contains("8.8.8.8".parse().unwrap()));
        assert!(f.contains("2001:db8::1".parse().unwrap()));
    }

    #[test]
    fn empty_matches_nothing() {
        let f = IpRangeFilter::default();
        assert!(!f.contains("8.8.8.8".parse().unwrap()));
    }

    #[test]
    fn cache_agrees_with_filter_and_flushes() {
        let c = CachedIpRangeFilter::new(filter(&["10.0.0.0/8"]));
        let inside: IpAddr = "10.9.9.9".parse().unwrap();
        let outside: IpAddr = "9.9.9.9".parse().unwrap();

        assert!(c.contains(inside));
        assert!(c.contains(inside));
        assert!(!c.contains(outside));
        assert_eq!(c.cached_len(), 2);

        // Fill past the flush threshold; the cache must stay bounded.
        for i in 0..=CACHE_FLUSH_THRESHOLD {
            let ip = IpAddr::V4(Ipv4Addr::from(0x0a00_0000u32 + i as u32));
            c.contains(ip);
        }
        assert!(c.cached_len() <= CACHE_FLUSH_THRESHOLD + 1);
        assert!(c.contains(inside));
    }
}
