//! The bookshelf schema: roles, users with a role reference, and books, with
//! triggers keeping `updated_at` current on every row update.

use crate::source::{EmbeddedSource, MigrationDef};

pub static MIGRATIONS: [MigrationDef; 3] = [
    MigrationDef {
        version: 1,
        name: "create_roles",
        up: include_str!("../../../migrations/0001_create_roles.up.sql"),
        down: Some(include_str!("../../../migrations/0001_create_roles.down.sql")),
    },
    MigrationDef {
        version: 2,
        name: "create_users",
        up: include_str!("../../../migrations/0002_create_users.up.sql"),
        down: Some(include_str!("../../../migrations/0002_create_users.down.sql")),
    },
    MigrationDef {
        version: 3,
        name: "create_books",
        up: include_str!("../../../migrations/0003_create_books.up.sql"),
        down: Some(include_str!("../../../migrations/0003_create_books.down.sql")),
    },
];

pub fn source() -> EmbeddedSource {
    EmbeddedSource::new(&MIGRATIONS)
}
