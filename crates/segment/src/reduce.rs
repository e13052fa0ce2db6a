use crate::Rect;

/// Folds the keys below a tree node into a single summary value.
///
/// The same function combines leaf keys and, one level up, the summaries
/// of child nodes, so it must be associative over those inputs. Inputs
/// always arrive in stored order.
pub trait Reducer: Send + Sync {
    fn reduce(&self, keys: &[&[u8]]) -> Vec<u8>;
}

impl<F> Reducer for F
where
    F: Fn(&[&[u8]]) -> Vec<u8> + Send + Sync,
{
    fn reduce(&self, keys: &[&[u8]]) -> Vec<u8> {
        self(keys)
    }
}

/// Default scalar summary: the smallest key of the subtree.
#[derive(Debug, Default, Clone, Copy)]
pub struct MinKey;

impl Reducer for MinKey {
    fn reduce(&self, keys: &[&[u8]]) -> Vec<u8> {
        keys.first().map(|k| k.to_vec()).unwrap_or_default()
    }
}

/// Spatial summary: the bounding box of every rectangle below a node.
///
/// Inputs that are not encoded rectangles are ignored; an empty fold
/// yields an empty summary.
#[derive(Debug, Default, Clone, Copy)]
pub struct BoundingBox;

impl Reducer for BoundingBox {
    fn reduce(&self, keys: &[&[u8]]) -> Vec<u8> {
        keys.iter()
            .filter_map(|k| Rect::from_bytes(k))
            .reduce(|acc, r| acc.union(&r))
            .map(|r| r.to_bytes().to_vec())
            .unwrap_or_default()
    }
}
