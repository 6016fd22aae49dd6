use std::collections::HashSet;

use tracing::warn;

use crate::playlist::{Rendition, RenditionType, Variant};

/// Chooses which variants and renditions of a master playlist get loaded.
///
/// Both methods are called synchronously while the master playlist is being
/// processed. Returning `None` selects every candidate.
pub trait SelectionPort: Send {
    fn choose_variants(&mut self, variants: &[Variant]) -> Option<Vec<usize>> {
        let _ = variants;
        None
    }

    /// Called once per selected variant for each non-empty rendition group.
    fn choose_renditions(
        &mut self,
        kind: RenditionType,
        renditions: &[Rendition],
    ) -> Option<Vec<usize>> {
        let _ = (kind, renditions);
        None
    }
}

/// Loads everything
#[derive(Debug, Clone, Copy, Default)]
pub struct SelectAll;

impl SelectionPort for SelectAll {}

type VariantFn = Box<dyn FnMut(&[Variant]) -> Vec<usize> + Send>;
type RenditionFn = Box<dyn FnMut(RenditionType, &[Rendition]) -> Vec<usize> + Send>;

/// [`SelectionPort`] assembled from closures. Unset callbacks select all.
///
/// ```
/// use hls_stream::Selector;
///
/// // Only the first variant, and no alternative renditions
/// let selector = Selector::new()
///     .on_variants(|_| vec![0])
///     .on_renditions(|_, _| Vec::new());
/// # let _ = selector;
/// ```
#[derive(Default)]
pub struct Selector {
    variants: Option<VariantFn>,
    renditions: Option<RenditionFn>,
}

impl Selector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_variants(
        mut self,
        choose: impl FnMut(&[Variant]) -> Vec<usize> + Send + 'static,
    ) -> Self {
        self.variants = Some(Box::new(choose));
        self
    }

    pub fn on_renditions(
        mut self,
        choose: impl FnMut(RenditionType, &[Rendition]) -> Vec<usize> + Send + 'static,
    ) -> Self {
        self.renditions = Some(Box::new(choose));
        self
    }
}

impl SelectionPort for Selector {
    fn choose_variants(&mut self, variants: &[Variant]) -> Option<Vec<usize>> {
        self.variants.as_mut().map(|choose| choose(variants))
    }

    fn choose_renditions(
        &mut self,
        kind: RenditionType,
        renditions: &[Rendition],
    ) -> Option<Vec<usize>> {
        self.renditions
            .as_mut()
            .map(|choose| choose(kind, renditions))
    }
}

impl std::fmt::Debug for Selector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Selector")
            .field("variants", &self.variants.is_some())
            .field("renditions", &self.renditions.is_some())
            .finish()
    }
}

/// Turns a selection into valid, distinct indices in the order given.
pub(crate) fn sanitize(selection: Option<Vec<usize>>, len: usize, what: &str) -> Vec<usize> {
    let Some(indices) = selection else {
        return (0..len).collect();
    };
    let mut seen = HashSet::new();
    indices
        .into_iter()
        .filter(|&index| {
            if index >= len {
                warn!(index, len, "Ignoring out-of-range {what} selection");
                return false;
            }
            seen.insert(index)
        })
        .collect()
}
