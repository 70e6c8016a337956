mod tests_build_read;
mod tests_column_reader;
mod tests_meta;
