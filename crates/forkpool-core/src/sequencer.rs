use crate::error::{ForkpoolError, Result};
use crate::naming::DatasetPath;
use crate::types::Generation;

/// Compute the next snapshot generation for one target
///
/// `existing` holds the target's snapshot paths (data rows only, the
/// listing header is already gone). Returns `max + 1`, or
/// [`Generation::FIRST`] when there are none. A suffix that is not a
/// positive number, or a maximum with no successor, fails with a parse
/// error.
pub fn next_generation<'a, I>(existing: I) -> Result<Generation>
where
    I: IntoIterator<Item = &'a DatasetPath>,
{
    let mut max: Option<(Generation, &DatasetPath)> = None;
    for path in existing {
        let generation = path.generation()?;
        if max.is_none_or(|(m, _)| generation > m) {
            max = Some((generation, path));
        }
    }
    match max {
        None => Ok(Generation::FIRST),
        Some((m, path)) => m.next().ok_or_else(|| {
            ForkpoolError::parse(path.as_str(), "no generation left after this one")
        }),
    }
}

/// Like [`next_generation`], but first checks every snapshot belongs to
/// `target` itself rather than a descendant
pub fn next_generation_for(target: &DatasetPath, existing: &[DatasetPath]) -> Result<Generation> {
    if let Some(stray) = existing.iter().find(|p| p.dataset() != *target) {
        return Err(ForkpoolError::parse(
            stray.as_str(),
            format!("snapshot does not belong to target '{}'", target),
        ));
    }
    next_generation(existing)
}
