// Core modules implementing storage, cursors, migrations, and error modeling.
pub mod clock;
pub mod cursor;
pub mod entry;
pub mod error;
pub mod migrate;
pub mod source;
pub mod status_map;
pub mod timestamp;
