//! Concrete pipeline stages and the stage factory.
//!
//! The factory keeps a registry of stage constructors so applications can
//! build pipelines (and `--set stage.prop` routing) from type names.
//! Built-in stages register on first access; custom stages can be added
//! at any time with [`register_stage`].

pub mod ar_detect;
pub mod magnitude;
pub mod source;
pub mod temporal_reduction;
pub mod vertical_integral;
pub mod vorticity;
pub mod writer;

pub use ar_detect::ArDetect;
pub use magnitude::Magnitude;
pub use source::Source;
pub use temporal_reduction::TemporalReduction;
pub use vertical_integral::VerticalIntegral;
pub use vorticity::Vorticity;
pub use writer::Writer;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use crate::algorithm::Algorithm;
use crate::comm::SelfCommunicator;
use crate::error::{Error, Result};
use crate::io::native::NativeDriver;

type StageConstructor = Box<dyn Fn() -> Box<dyn Algorithm> + Send + Sync>;

static STAGE_REGISTRY: OnceLock<Mutex<HashMap<String, StageConstructor>>> = OnceLock::new();

fn registry() -> &'static Mutex<HashMap<String, StageConstructor>> {
    STAGE_REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

fn ensure_default_stages() {
    static INITIALIZED: OnceLock<()> = OnceLock::new();
    INITIALIZED.get_or_init(|| {
        register_stage(
            "source",
            Box::new(|| Box::new(Source::new(Arc::new(NativeDriver), Arc::new(SelfCommunicator)))),
        );
        register_stage(
            "writer",
            Box::new(|| Box::new(Writer::new(Arc::new(NativeDriver)))),
        );
        register_stage("vorticity", Box::new(|| Box::new(Vorticity::new())));
        register_stage(
            "vertical_integral",
            Box::new(|| Box::new(VerticalIntegral::new())),
        );
        register_stage("magnitude", Box::new(|| Box::new(Magnitude::new())));
        register_stage("ar_detect", Box::new(|| Box::new(ArDetect::new())));
        register_stage(
            "temporal_reduction",
            Box::new(|| Box::new(TemporalReduction::new())),
        );
        tracing::debug!("default stages registered");
    });
}

/// Registers (or replaces) a stage constructor under a type name.
pub fn register_stage(name: &str, constructor: StageConstructor) {
    let mut registry = registry().lock().unwrap();
    registry.insert(name.to_string(), constructor);
}

/// Instantiates a stage by type name.
pub fn create_stage(name: &str) -> Result<Box<dyn Algorithm>> {
    ensure_default_stages();
    let registry = registry().lock().unwrap();
    registry
        .get(name)
        .map(|constructor| constructor())
        .ok_or_else(|| Error::config(format!("unknown stage type '{name}'")))
}

/// Names of every registered stage type, sorted.
pub fn list_stages() -> Vec<String> {
    ensure_default_stages();
    let registry = registry().lock().unwrap();
    let mut names: Vec<String> = registry.keys().cloned().collect();
    names.sort();
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn built_in_stages_are_registered() {
        let names = list_stages();
        for expected in [
            "ar_detect",
            "magnitude",
            "source",
            "temporal_reduction",
            "vertical_integral",
            "vorticity",
            "writer",
        ] {
            assert!(names.contains(&expected.to_string()), "{expected}");
        }
    }

    #[test]
    fn created_stages_expose_their_schema() {
        let stage = create_stage("vorticity").unwrap();
        assert_eq!(stage.name(), "vorticity");
        assert!(!stage.property_schema().is_empty());
        assert!(create_stage("nope").is_err());
    }
}
