pub mod effects;
pub mod events;
pub mod runs;
pub mod settings;
pub mod studio;
