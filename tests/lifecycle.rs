/*!
 * Lifecycle Integration Tests
 */

#[path = "common/mod.rs"]
mod common;

#[path = "lifecycle/admission_test.rs"]
mod admission_test;

#[path = "lifecycle/lifecycle_test.rs"]
mod lifecycle_test;

#[path = "lifecycle/serialization_test.rs"]
mod serialization_test;
