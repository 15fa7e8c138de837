use bitflags::bitflags;

bitflags! {
    /// State bits of a primitive
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct PrimitiveFlags: u16 {
        /// Changed locally and not uploaded yet
        const MODIFIED           = 1 << 0;
        /// Exists on the server; cleared when the server reports it deleted
        const VISIBLE            = 1 << 1;
        /// Deleted locally
        const DELETED            = 1 << 2;
        /// Only id and kind are known
        const INCOMPLETE         = 1 << 3;
        /// Matched by an active filter
        const DISABLED           = 1 << 4;
        /// Disabled and hidden instead of greyed out
        const HIDE_IF_DISABLED   = 1 << 5;
        /// Disabled by a filter on its kind
        const DISABLED_TYPE      = 1 << 6;
        /// Hidden by a filter on its kind
        const HIDDEN_TYPE        = 1 << 7;
        /// Carries a direction-sensitive tag
        const HAS_DIRECTIONS     = 1 << 8;
        /// Has at least one interesting tag
        const TAGGED             = 1 << 9;
        /// Direction tags point against the node order (`oneway=-1`)
        const DIRECTION_REVERSED = 1 << 10;
        const HIGHLIGHTED        = 1 << 11;
        /// Has a work-in-progress tag such as `fixme`
        const ANNOTATED          = 1 << 12;
        /// Kept visible regardless of filters
        const PRESERVED          = 1 << 13;
    }
}

impl Default for PrimitiveFlags {
    fn default() -> Self {
        PrimitiveFlags::VISIBLE
    }
}
