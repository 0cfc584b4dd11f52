pub mod archive;
pub mod exporter;
pub mod fsops;

pub use archive::{extract_archive, list_entries, read_entry, write_archive};
pub use exporter::{DatabaseExporter, DatabaseSnapshot, ExportError, PgDumpExporter, SqliteFileExporter};
pub use fsops::{copy_dir_recursive, path_exists, remove_dir_best_effort, remove_file_if_exists, CopySummary};
