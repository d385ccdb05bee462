//! Bounded worker pools for fanning file operations out.
//!
//! Stores advertise whether concurrent I/O helps them
//! ([`execute_in_parallel`](crate::store::FileStore::execute_in_parallel));
//! when it doesn't, the pool degrades to a single worker so remote
//! sessions and spinning disks see strictly sequential requests.

use anyhow::{Context, Result};
use rayon::prelude::*;

/// Builds a pool with as many workers as the machine has cores,
/// or exactly one when `parallel` is false.
fn pool(parallel: bool) -> Result<rayon::ThreadPool> {
    let threads = if parallel { 0 } else { 1 };
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build()
        .context("Couldn't build a worker pool")
}

/// Maps `f` over `items` on a worker pool, collecting every result.
///
/// The first error wins; remaining workers finish their current item and
/// stop.
pub fn map<T, U, F>(parallel: bool, items: &[T], f: F) -> Result<Vec<U>>
where
    T: Sync,
    U: Send,
    F: Fn(&T) -> Result<U> + Sync + Send,
{
    pool(parallel)?.install(|| items.par_iter().map(f).collect())
}

/// Like [`map`], but for operations with nothing to return.
pub fn for_each<T, F>(parallel: bool, items: &[T], f: F) -> Result<()>
where
    T: Sync,
    F: Fn(&T) -> Result<()> + Sync + Send,
{
    pool(parallel)?.install(|| items.par_iter().map(f).collect())
}

#[cfg(test)]
mod test {
    use super::*;

    use anyhow::bail;

    #[test]
    fn maps_in_order() -> Result<()> {
        let doubled = map(true, &[1, 2, 3, 4], |i| Ok(i * 2))?;
        assert_eq!(doubled, vec![2, 4, 6, 8]);
        Ok(())
    }

    #[test]
    fn sequential_fallback() -> Result<()> {
        let doubled = map(false, &[1, 2, 3], |i| Ok(i * 2))?;
        assert_eq!(doubled, vec![2, 4, 6]);
        Ok(())
    }

    #[test]
    fn first_error_wins() {
        let res: Result<Vec<i32>> = map(true, &[1, 2, 3], |i| {
            if *i == 2 {
                bail!("two is right out");
            }
            Ok(*i)
        });
        assert!(res.is_err());
    }
}
