/*!
 * Storage
 * Atomic JSON persistence of the instance table
 */

mod autosave;
mod store;

pub use autosave::AutosaveJob;
pub use store::{read_json, write_json_atomic, StateFile, StateStore};
