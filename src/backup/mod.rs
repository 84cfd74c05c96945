pub mod archive;
pub mod backup_config;
pub mod compress;
pub mod file_ext;
pub mod finish;
pub mod orchestrator;
pub mod result_error;
pub mod scan;
pub mod watermark;

macro_rules! function_path {
    () => {
        concat!(module_path!(), "::", function_name!(), " ", file!(), ":", line!())
    };
}

pub(crate) use function_path;
