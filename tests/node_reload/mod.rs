mod hot_reload_test;
