pub mod providers;
pub mod run;
