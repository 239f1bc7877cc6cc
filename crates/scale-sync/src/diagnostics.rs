//! # Upload Diagnostics
//!
//! Finds which products make a device refuse an upload.
//!
//! ## Search Strategy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  1. Walk the table in chunks (50, doubling to 500 while chunks pass)   │
//! │                                                                         │
//! │     [ok 50][ok 100][ FAIL 200 ][ok 50] ...                             │
//! │                         │                                               │
//! │  2. Narrow a failing chunk to a minimal failing group                  │
//! │                         ▼                                               │
//! │       halve: left fails? ─► recurse left                               │
//! │              right fails? ─► recurse right                             │
//! │              neither ─► the fault needs items from both halves:        │
//! │                         try [left[0], r] for each r in right           │
//! │                                                                         │
//! │  3. Upload each member of the group alone; those that fail alone       │
//! │     are the bad products                                                │
//! │                                                                         │
//! │  After any failure the chunk size drops back to 50.                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Only "the device refused it" counts as a failed attempt. A lost
//! connection or a timeout aborts the diagnosis: the answer would be
//! meaningless.

use serde::Serialize;
use std::future::Future;
use tracing::{debug, info};

use scale_core::{Plu, Product};

use crate::error::{SyncError, SyncResult};

/// Chunk sizes for the forward walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiagnosisSettings {
    pub initial_chunk: usize,
    pub max_chunk: usize,
}

impl Default for DiagnosisSettings {
    fn default() -> Self {
        Self {
            initial_chunk: 50,
            max_chunk: 500,
        }
    }
}

/// What the diagnosis found.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadDiagnosis {
    /// Products uploaded as part of a chunk that passed.
    pub ok_count: usize,
    pub total_count: usize,
    /// Products the device refuses even on their own.
    pub bad_products: Vec<Product>,
    /// PLUs of each narrowed failing group, in table order.
    pub minimal_failing_groups: Vec<Vec<Plu>>,
}

/// Classifies the outcome of one trial upload.
///
/// `Ok(true)` passed, `Ok(false)` refused; errors that say nothing about
/// the payload propagate.
pub fn classify_attempt(result: SyncResult<()>) -> SyncResult<bool> {
    match result {
        Ok(()) => Ok(true),
        Err(SyncError::Rejected(_)) | Err(SyncError::Protocol(_)) => Ok(false),
        Err(err) => Err(err),
    }
}

/// Runs the search over `products` using `try_upload` for every attempt.
pub async fn find_breaking_products<F, Fut>(
    products: &[Product],
    settings: DiagnosisSettings,
    mut try_upload: F,
) -> SyncResult<UploadDiagnosis>
where
    F: FnMut(Vec<Product>) -> Fut,
    Fut: Future<Output = SyncResult<bool>>,
{
    let initial = settings.initial_chunk.max(1);
    let max = settings.max_chunk.max(initial);
    let total = products.len();

    let mut report = UploadDiagnosis {
        total_count: total,
        ..Default::default()
    };

    info!(total, "Upload diagnosis started");

    let mut chunk_size = initial;
    let mut idx = 0;
    while idx < total {
        let end = (idx + chunk_size).min(total);
        let chunk = &products[idx..end];

        if try_upload(chunk.to_vec()).await? {
            report.ok_count += chunk.len();
            idx = end;
            chunk_size = (chunk_size * 2).min(max);
            continue;
        }

        debug!(idx, size = chunk.len(), "Chunk refused");
        chunk_size = initial;

        if chunk.len() == 1 {
            report.bad_products.push(chunk[0].clone());
            idx = end;
            continue;
        }

        let group = narrow_failing_group(chunk.to_vec(), &mut try_upload).await?;
        report
            .minimal_failing_groups
            .push(group.iter().map(|p| p.plu).collect());

        for product in group {
            if !try_upload(vec![product.clone()]).await? {
                report.bad_products.push(product);
            }
        }
        idx = end;
    }

    info!(
        total,
        ok = report.ok_count,
        bad = report.bad_products.len(),
        groups = report.minimal_failing_groups.len(),
        "Upload diagnosis finished"
    );
    Ok(report)
}

/// Shrinks a failing group while some strict subset still fails.
async fn narrow_failing_group<F, Fut>(
    mut group: Vec<Product>,
    try_upload: &mut F,
) -> SyncResult<Vec<Product>>
where
    F: FnMut(Vec<Product>) -> Fut,
    Fut: Future<Output = SyncResult<bool>>,
{
    while group.len() > 1 {
        let right = group.split_off(group.len() / 2);
        let left = group;

        if !try_upload(left.clone()).await? {
            group = left;
            continue;
        }
        if !try_upload(right.clone()).await? {
            group = right;
            continue;
        }

        // Neither half fails alone: pair the first left item with each right item.
        let mut combo = None;
        for item in &right {
            let candidate = vec![left[0].clone(), item.clone()];
            if !try_upload(candidate.clone()).await? {
                combo = Some(candidate);
                break;
            }
        }

        let whole_len = left.len() + right.len();
        match combo {
            Some(candidate) if candidate.len() < whole_len => group = candidate,
            Some(candidate) => return Ok(candidate),
            None => {
                let mut whole = left;
                whole.extend(right);
                return Ok(whole);
            }
        }
    }
    Ok(group)
}

#[cfg(test)]
mod tests {
    use super::*;
    use scale_core::Money;
    use std::collections::HashSet;

    fn products(n: u32) -> Vec<Product> {
        (1..=n)
            .map(|i| Product::new(Plu::new(i).unwrap(), format!("Item {}", i), Money::from_cents(100)))
            .collect()
    }

    fn plus(items: &[Product]) -> HashSet<u32> {
        items.iter().map(|p| p.plu.get()).collect()
    }

    #[tokio::test]
    async fn test_all_good() {
        let items = products(120);
        let mut attempts = 0;
        let report = find_breaking_products(&items, DiagnosisSettings::default(), |_| {
            attempts += 1;
            async { Ok(true) }
        })
        .await
        .unwrap();

        assert_eq!(report.ok_count, 120);
        assert!(report.bad_products.is_empty());
        // 50 then 70 (chunk grew to 100).
        assert_eq!(attempts, 2);
    }

    #[tokio::test]
    async fn test_finds_single_bad_products() {
        let items = products(200);
        let bad: HashSet<u32> = [7, 130].into_iter().collect();
        let report = find_breaking_products(&items, DiagnosisSettings::default(), |batch| {
            let ok = !batch.iter().any(|p| bad.contains(&p.plu.get()));
            async move { Ok(ok) }
        })
        .await
        .unwrap();

        assert_eq!(plus(&report.bad_products), bad);
        assert_eq!(report.minimal_failing_groups.len(), 2);
        assert_eq!(report.minimal_failing_groups[0], vec![Plu::new(7).unwrap()]);
        assert_eq!(report.total_count, 200);
    }

    #[tokio::test]
    async fn test_pair_that_only_fails_together() {
        // 3 and 40 are fine alone but the device refuses them together.
        let items = products(50);
        let report = find_breaking_products(&items, DiagnosisSettings::default(), |batch| {
            let set = plus(&batch);
            let ok = !(set.contains(&3) && set.contains(&40));
            async move { Ok(ok) }
        })
        .await
        .unwrap();

        assert!(report.bad_products.is_empty());
        assert_eq!(report.minimal_failing_groups.len(), 1);
        let group: HashSet<u32> = report.minimal_failing_groups[0].iter().map(|p| p.get()).collect();
        assert!(group.contains(&3) && group.contains(&40));
        assert_eq!(report.ok_count, 0);
    }

    #[tokio::test]
    async fn test_connection_error_aborts() {
        let items = products(10);
        let err = find_breaking_products(&items, DiagnosisSettings::default(), |_| async {
            Err(SyncError::Connection("refused".into()))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, SyncError::Connection(_)));
    }

    #[test]
    fn test_classify_attempt() {
        assert!(classify_attempt(Ok(())).unwrap());
        assert!(!classify_attempt(Err(SyncError::Rejected(vec![]))).unwrap());
        assert!(!classify_attempt(Err(SyncError::Protocol("bad".into()))).unwrap());
        assert!(classify_attempt(Err(SyncError::Timeout(std::time::Duration::from_secs(1)))).is_err());
    }
}
