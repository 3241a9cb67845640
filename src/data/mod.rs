//! Input collection handling
//!
//! The planner accepts three shapes of input: random-access sequences,
//! bounded single-pass iterators, and unbounded streams. Sampling must not
//! lose items, so single-pass inputs buffer their first few items and splice
//! them back in front of the remainder; downstream execution sees the full
//! sequence exactly once, in order.

use std::fmt;

/// The shape of an input collection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataKind {
    RandomAccess,
    BoundedOnePass,
    UnboundedStream,
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataKind::RandomAccess => write!(f, "random_access"),
            DataKind::BoundedOnePass => write!(f, "bounded_one_pass"),
            DataKind::UnboundedStream => write!(f, "unbounded_stream"),
        }
    }
}

/// A single-pass iterator with a sampling buffer spliced in front
pub struct Prefixed<I> {
    buffered: Vec<I>,
    rest: Box<dyn Iterator<Item = I> + Send>,
    /// Exact number of items still inside `rest`, when the source reports one
    rest_len: Option<usize>,
    exhausted: bool,
}

impl<I> fmt::Debug for Prefixed<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Prefixed")
            .field("buffered", &self.buffered.len())
            .field("rest_len", &self.rest_len)
            .field("exhausted", &self.exhausted)
            .finish()
    }
}

/// Tagged input collection handle
///
/// Operations that need random access refuse `UnboundedStream` at this
/// boundary instead of deep inside the planner.
#[derive(Debug)]
pub enum DataSource<I> {
    RandomAccess(Vec<I>),
    BoundedOnePass(Prefixed<I>),
    UnboundedStream(Prefixed<I>),
}

impl<I> DataSource<I> {
    /// Wrap an owned sequence
    pub fn from_vec(items: Vec<I>) -> Self {
        DataSource::RandomAccess(items)
    }

    /// Wrap a bounded single-pass iterator
    ///
    /// The exact length is captured from `size_hint` when the iterator
    /// reports one (`upper == Some(lower)`); otherwise the planner falls
    /// back to hints.
    pub fn from_iter<It>(iter: It) -> Self
    where
        It: Iterator<Item = I> + Send + 'static,
    {
        let (lower, upper) = iter.size_hint();
        let rest_len = match upper {
            Some(upper) if upper == lower => Some(lower),
            _ => None,
        };
        DataSource::BoundedOnePass(Prefixed {
            buffered: Vec::new(),
            rest: Box::new(iter),
            rest_len,
            exhausted: false,
        })
    }

    /// Wrap an unbounded stream; the planner never materialises it eagerly
    pub fn from_stream<It>(iter: It) -> Self
    where
        It: Iterator<Item = I> + Send + 'static,
    {
        DataSource::UnboundedStream(Prefixed {
            buffered: Vec::new(),
            rest: Box::new(iter),
            rest_len: None,
            exhausted: false,
        })
    }

    pub fn kind(&self) -> DataKind {
        match self {
            DataSource::RandomAccess(_) => DataKind::RandomAccess,
            DataSource::BoundedOnePass(_) => DataKind::BoundedOnePass,
            DataSource::UnboundedStream(_) => DataKind::UnboundedStream,
        }
    }

    /// Total item count, when knowable without consuming the input
    pub fn len(&self) -> Option<usize> {
        match self {
            DataSource::RandomAccess(items) => Some(items.len()),
            DataSource::BoundedOnePass(prefixed) => {
                if prefixed.exhausted {
                    Some(prefixed.buffered.len())
                } else {
                    prefixed.rest_len.map(|rest| rest + prefixed.buffered.len())
                }
            }
            DataSource::UnboundedStream(_) => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == Some(0)
    }

    /// The iterator's lower bound on remaining items, for conservative planning
    pub fn lower_bound(&self) -> usize {
        match self {
            DataSource::RandomAccess(items) => items.len(),
            DataSource::BoundedOnePass(prefixed) | DataSource::UnboundedStream(prefixed) => {
                let rest = if prefixed.exhausted {
                    0
                } else {
                    prefixed.rest.size_hint().0
                };
                prefixed.buffered.len() + rest
            }
        }
    }

    /// Make up to `k` items available for inspection without consuming them
    ///
    /// Random-access inputs are borrowed in place. Single-pass inputs pull
    /// items into the splice buffer; a later `into_iter` replays them first,
    /// so the full sequence is still observed exactly once.
    pub fn buffer_prefix(&mut self, k: usize) -> &[I] {
        match self {
            DataSource::RandomAccess(items) => {
                let end = k.min(items.len());
                &items[..end]
            }
            DataSource::BoundedOnePass(prefixed) | DataSource::UnboundedStream(prefixed) => {
                while prefixed.buffered.len() < k && !prefixed.exhausted {
                    match prefixed.rest.next() {
                        Some(item) => {
                            prefixed.buffered.push(item);
                            if let Some(len) = prefixed.rest_len.as_mut() {
                                *len = len.saturating_sub(1);
                            }
                        }
                        None => prefixed.exhausted = true,
                    }
                }
                &prefixed.buffered
            }
        }
    }
}

impl<I: Send + 'static> DataSource<I> {
    /// Consume the handle, yielding every original item in order
    pub fn into_iter(self) -> Box<dyn Iterator<Item = I> + Send> {
        match self {
            DataSource::RandomAccess(items) => Box::new(items.into_iter()),
            DataSource::BoundedOnePass(prefixed) | DataSource::UnboundedStream(prefixed) => {
                if prefixed.exhausted {
                    Box::new(prefixed.buffered.into_iter())
                } else {
                    Box::new(prefixed.buffered.into_iter().chain(prefixed.rest))
                }
            }
        }
    }
}

impl<I> From<Vec<I>> for DataSource<I> {
    fn from(items: Vec<I>) -> Self {
        DataSource::from_vec(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_access_prefix_does_not_consume() {
        let mut data = DataSource::from_vec(vec![1, 2, 3, 4, 5]);
        assert_eq!(data.buffer_prefix(3), &[1, 2, 3]);
        assert_eq!(data.len(), Some(5));
        let all: Vec<i32> = data.into_iter().collect();
        assert_eq!(all, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_one_pass_resplices_in_order() {
        let mut data = DataSource::from_iter((0..10).filter(|n| n % 2 == 0));
        assert_eq!(data.kind(), DataKind::BoundedOnePass);
        // filter() cannot report an exact length
        assert_eq!(data.len(), None);
        assert_eq!(data.buffer_prefix(3), &[0, 2, 4]);
        let all: Vec<i32> = data.into_iter().collect();
        assert_eq!(all, vec![0, 2, 4, 6, 8]);
    }

    #[test]
    fn test_one_pass_exact_len_tracks_buffering() {
        let mut data = DataSource::from_iter(0..100);
        assert_eq!(data.len(), Some(100));
        data.buffer_prefix(5);
        assert_eq!(data.len(), Some(100));
    }

    #[test]
    fn test_prefix_exhausting_short_input_learns_length() {
        let mut data = DataSource::from_iter((0..3).filter(|_| true));
        assert_eq!(data.len(), None);
        assert_eq!(data.buffer_prefix(10), &[0, 1, 2]);
        assert_eq!(data.len(), Some(3));
        let all: Vec<i32> = data.into_iter().collect();
        assert_eq!(all, vec![0, 1, 2]);
    }

    #[test]
    fn test_unbounded_stream_stays_lazy() {
        let mut data = DataSource::from_stream(0u64..);
        assert_eq!(data.kind(), DataKind::UnboundedStream);
        assert_eq!(data.len(), None);
        assert_eq!(data.buffer_prefix(4), &[0, 1, 2, 3]);
        let first_eight: Vec<u64> = data.into_iter().take(8).collect();
        assert_eq!(first_eight, vec![0, 1, 2, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn test_repeated_prefix_is_idempotent() {
        let mut data = DataSource::from_iter(0..10);
        assert_eq!(data.buffer_prefix(3).len(), 3);
        assert_eq!(data.buffer_prefix(3).len(), 3);
        let all: Vec<i32> = data.into_iter().collect();
        assert_eq!(all.len(), 10);
    }
}
