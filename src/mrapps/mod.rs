pub mod pi;

use crate::mr::{MRApp, MrError};

pub fn get_app(app: &str, samples_per_task: u64) -> Result<Box<dyn MRApp>, MrError> {
    match app {
        "pi" => Ok(Box::new(pi::Pi::new(samples_per_task))),
        _ => Err(MrError::Usage(format!("unknown app {app:?}, expected \"pi\""))),
    }
}
