use std::io::Write;
use std::sync::Arc;

use tempfile::NamedTempFile;

use taxmatch::taxonomy::{TaxTree, TaxonomyOracle};

const NODES_DMP: &str = "\
1\t|\t1\t|\tno rank\t|\t\t|
2\t|\t1\t|\tsuperkingdom\t|\t\t|
1224\t|\t2\t|\tphylum\t|\t\t|
562\t|\t1224\t|\tspecies\t|\t\t|
28901\t|\t1224\t|\tspecies\t|\t\t|
2157\t|\t1\t|\tsuperkingdom\t|\t\t|
";

fn write_temp(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

fn oracle_from(contents: &str) -> Arc<dyn TaxonomyOracle> {
    let file = write_temp(contents);
    Arc::new(TaxTree::from_file(file.path()).unwrap())
}

#[test]
fn test_nodes_dmp_file() {
    let file = write_temp(NODES_DMP);
    let tree = TaxTree::from_file(file.path()).unwrap();
    assert_eq!(tree.len(), 6);

    let ecoli = tree.node_of("562").unwrap();
    let proteo = tree.node_of("1224").unwrap();
    assert_eq!(tree.parent_of(ecoli), Some(proteo));
    assert_eq!(tree.depth(ecoli), 3);
    assert_eq!(tree.parent_of(tree.node_of("1").unwrap()), None);
}

#[test]
fn test_oracle_queries_by_id() {
    let oracle = oracle_from(NODES_DMP);
    assert_eq!(oracle.lca_of_ids("562", "28901").as_deref(), Some("1224"));
    assert_eq!(oracle.lca_of_ids("562", "2157").as_deref(), Some("1"));
    assert_eq!(oracle.lca_of_ids("562", "562").as_deref(), Some("562"));
    assert_eq!(oracle.lca_of_ids("562", "1224").as_deref(), Some("1224"));
    assert_eq!(oracle.lca_of_ids("562", "999"), None);

    assert!(oracle.is_ancestor_of_id("562", "2"));
    assert!(oracle.is_ancestor_of_id("562", "562"));
    assert!(!oracle.is_ancestor_of_id("2", "562"));
    assert!(!oracle.is_ancestor_of_id("2157", "2"));
    assert!(!oracle.is_ancestor_of_id("999", "1"));
}

#[test]
fn test_tab_file_with_forest() {
    let oracle = oracle_from("# child\tparent\nA\t0\nB\tA\nC\tB\nX\tX\nY\tX\n");
    assert_eq!(oracle.lca_of_ids("C", "B").as_deref(), Some("B"));
    assert_eq!(oracle.lca_of_ids("C", "Y"), None);
    let c = oracle.node_of("C").unwrap();
    assert_eq!(oracle.id_of(c), "C");
}

#[test]
fn test_oracle_shared_across_threads() {
    let oracle = oracle_from(NODES_DMP);
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let oracle = Arc::clone(&oracle);
            std::thread::spawn(move || oracle.lca_of_ids("28901", "562"))
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.join().unwrap().as_deref(), Some("1224"));
    }
}

#[test]
fn test_rejects_broken_files() {
    let cycle = write_temp("A\tB\nB\tA\n");
    assert!(TaxTree::from_file(cycle.path()).is_err());
    let dangling = write_temp("A\tMISSING\n");
    assert!(TaxTree::from_file(dangling.path()).is_err());
    let single_field = write_temp("A\n");
    assert!(TaxTree::from_file(single_field.path()).is_err());
    assert!(TaxTree::from_file("/nonexistent/taxonomy.tsv").is_err());
}
