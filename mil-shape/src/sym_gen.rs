//! Symbol generation.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::dim::{Symbol, VariadicSymbol};

/// Counter shared by all symbol kinds, so a symbol and a variadic symbol never
/// share an ID.
static NEXT_SYMBOL_ID: AtomicU32 = AtomicU32::new(0);

fn next_id() -> u32 {
    NEXT_SYMBOL_ID.fetch_add(1, Ordering::Relaxed)
}

/// Generate a new symbol for a dimension whose size is not known until the
/// program runs.
///
/// IDs are allocated from a process-wide counter which is never reset, so
/// symbols created by programs being built concurrently on different threads
/// never collide.
pub fn new_symbol() -> Symbol {
    Symbol(next_id())
}

/// Generate a new symbol standing for an unknown number of dimensions.
pub fn new_variadic_symbol() -> VariadicSymbol {
    VariadicSymbol(next_id())
}
