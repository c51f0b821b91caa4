use std::net::IpAddr;

use config::{range::next_ip, Range, RangeSet};

/// Walks every address of a range set once, starting just after the last
/// reserved address (or at the first range's start), wrapping from the end
/// of one range to the start of the next. Gateways are skipped.
#[derive(Debug, Clone)]
pub struct RangeIter<'a> {
    set: &'a RangeSet,
    idx: usize,
    cur: Option<IpAddr>,
    start: Option<IpAddr>,
    done: bool,
}

impl<'a> RangeIter<'a> {
    /// `last` is ignored if it isn't in the set, the ranges may have changed
    /// since it was written
    pub fn new(set: &'a RangeSet, last: Option<IpAddr>) -> Self {
        let resume = last.and_then(|ip| {
            let ip = ip.to_canonical();
            set.iter().position(|r| r.contains(&ip)).map(|idx| (idx, ip))
        });
        let (idx, cur) = match resume {
            Some((idx, ip)) => (idx, Some(ip)),
            None => (0, None),
        };
        Self {
            set,
            idx,
            cur,
            start: None,
            done: false,
        }
    }
}

impl<'a> Iterator for RangeIter<'a> {
    type Item = (&'a Range, IpAddr);

    fn next(&mut self) -> Option<Self::Item> {
        let ranges = self.set.ranges();
        loop {
            if self.done {
                return None;
            }
            let mut range = ranges.get(self.idx)?;
            let ip = match self.cur {
                None => {
                    self.start = Some(range.range_start());
                    range.range_start()
                }
                Some(cur) => {
                    let next = if cur == range.range_end() {
                        self.idx = (self.idx + 1) % ranges.len();
                        range = ranges.get(self.idx)?;
                        range.range_start()
                    } else {
                        next_ip(cur)
                    };
                    match self.start {
                        // back where we started
                        Some(start) if start == next => {
                            self.done = true;
                            return None;
                        }
                        Some(_) => {}
                        None => self.start = Some(next),
                    }
                    next
                }
            };
            self.cur = Some(ip);
            if ip != range.gateway() {
                return Some((range, ip));
            }
        }
    }
}
