mod tests_memtable;
