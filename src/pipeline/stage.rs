//! Type-erased transform stages.
//!
//! A pipeline's stages change the element type at every step, so the chain
//! itself is stored as boxed `Any` values. The typed wrappers in
//! [`MapReducer`](super::MapReducer) guarantee that each stage only ever
//! receives what the previous one produced; a failed downcast is reported as
//! [`EngineError::StageTypeMismatch`] rather than a panic.

use crate::error::{EngineError, EngineResult};
use std::any::{Any, type_name};
use std::sync::Arc;

pub(crate) type AnyItem = Box<dyn Any + Send>;

type MapFn = Arc<dyn Fn(AnyItem) -> EngineResult<AnyItem> + Send + Sync>;
type FlatMapFn = Arc<dyn Fn(AnyItem) -> EngineResult<Vec<AnyItem>> + Send + Sync>;

#[derive(Clone)]
pub(crate) enum Stage {
    Map(MapFn),
    FlatMap(FlatMapFn),
}

impl Stage {
    pub(crate) fn map<A, B, F>(f: F) -> Self
    where
        A: Send + 'static,
        B: Send + 'static,
        F: Fn(A) -> B + Send + Sync + 'static,
    {
        Stage::Map(Arc::new(move |item: AnyItem| -> EngineResult<AnyItem> {
            let input = downcast::<A>(item)?;
            Ok(Box::new(f(input)) as AnyItem)
        }))
    }

    pub(crate) fn flat_map<A, B, I, F>(f: F) -> Self
    where
        A: Send + 'static,
        B: Send + 'static,
        I: IntoIterator<Item = B>,
        F: Fn(A) -> I + Send + Sync + 'static,
    {
        Stage::FlatMap(Arc::new(move |item: AnyItem| -> EngineResult<Vec<AnyItem>> {
            let input = downcast::<A>(item)?;
            Ok(f(input)
                .into_iter()
                .map(|out| Box::new(out) as AnyItem)
                .collect())
        }))
    }

    /// A flat map of zero or one element that passes the input through
    /// unchanged.
    pub(crate) fn filter<A, F>(predicate: F) -> Self
    where
        A: Send + 'static,
        F: Fn(&A) -> bool + Send + Sync + 'static,
    {
        Stage::FlatMap(Arc::new(move |item: AnyItem| -> EngineResult<Vec<AnyItem>> {
            let keep = item
                .downcast_ref::<A>()
                .map(&predicate)
                .ok_or(EngineError::StageTypeMismatch {
                    expected: type_name::<A>(),
                })?;
            Ok(if keep { vec![item] } else { Vec::new() })
        }))
    }
}

pub(crate) fn downcast<T: 'static>(item: AnyItem) -> EngineResult<T> {
    item.downcast::<T>()
        .map(|boxed| *boxed)
        .map_err(|_| EngineError::StageTypeMismatch {
            expected: type_name::<T>(),
        })
}

/// Run one input through the stage chain as a strict left fold.
pub(crate) fn apply(stages: &[Stage], input: AnyItem) -> EngineResult<Vec<AnyItem>> {
    let mut items = vec![input];
    for stage in stages {
        if items.is_empty() {
            break;
        }
        items = match stage {
            Stage::Map(f) => items.into_iter().map(|item| f(item)).collect::<EngineResult<_>>()?,
            Stage::FlatMap(f) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.extend(f(item)?);
                }
                out
            }
        };
    }
    Ok(items)
}
