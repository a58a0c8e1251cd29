pub mod differ;
pub mod exporter;
pub mod extractor;
pub mod filter;
pub mod glob;
pub mod hasher;
pub mod importer;
pub mod ingestor;
pub mod lineage;
pub mod validator;
