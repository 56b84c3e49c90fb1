mod compose_test;
