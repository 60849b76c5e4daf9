pub mod adapter;
pub mod canon;
pub mod config;
pub mod db;
pub mod densemap;
pub mod depfile;
pub mod error;
pub mod fs;
pub mod graph;
pub mod hash;
pub mod helper;
pub mod interrupt;
pub mod pipeline;
pub mod process;
pub mod progress;
pub mod publish;
pub mod run;
pub mod task;
pub mod tools;
pub mod trace;
pub mod work;
