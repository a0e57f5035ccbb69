mod support;

mod test_local_fast_store;
