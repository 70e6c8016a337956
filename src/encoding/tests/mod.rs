mod tests_row;
