mod code_pool;
