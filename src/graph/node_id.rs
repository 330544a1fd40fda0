use std::num::NonZero;

/// ID of a node in a [`Graph`](crate::Graph).
///
/// This is used to identify input and output values as well as internal
/// nodes. IDs are dense and allocated in insertion order.
#[derive(Copy, Clone, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct NodeId(NonZero<u32>);

impl NodeId {
    /// Return the underlying u32 value of the ID.
    pub fn as_u32(self) -> u32 {
        self.0.get() - 1
    }

    /// Return the underlying ID value as a usize, for slice indexing.
    pub fn as_usize(self) -> usize {
        self.as_u32() as usize
    }

    /// Construct a node ID from a u32 value.
    ///
    /// Panics if the value is `u32::MAX`.
    pub fn from_u32(value: u32) -> NodeId {
        // Valid node IDs are stored internally as `value + 1`, reserving 0 as
        // a niche so that `Option<NodeId>` is the same size as `NodeId`.
        NodeId(NonZero::new(value + 1).expect("node ID out of range"))
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.as_u32().fmt(f)
    }
}

impl std::fmt::Debug for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodeId({})", self.as_u32())
    }
}

#[cfg(test)]
mod tests {
    use super::NodeId;

    #[test]
    fn test_node_id_round_trip() {
        let id = NodeId::from_u32(42);
        assert_eq!(id.as_u32(), 42);
        assert_eq!(id.as_usize(), 42);
        assert_eq!(format!("{}", id), "42");
        assert_eq!(format!("{:?}", id), "NodeId(42)");
    }

    #[test]
    fn test_option_is_same_size() {
        assert_eq!(
            std::mem::size_of::<Option<NodeId>>(),
            std::mem::size_of::<NodeId>()
        );
    }
}
