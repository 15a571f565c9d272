/*!
 * Templates
 * Pluggable per-kind deployment recipes and their registry
 */

mod command;
mod registry;
mod traits;

pub use command::{CommandTemplate, COMMAND_KIND};
pub use registry::TemplateRegistry;
pub use traits::{ServiceTemplate, TemplateContext, TemplateError, TemplateResult};
