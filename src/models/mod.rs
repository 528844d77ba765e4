pub mod extension_model;
