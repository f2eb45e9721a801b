mod bootstrap_test;
mod lifecycle_test;
mod limits_test;
