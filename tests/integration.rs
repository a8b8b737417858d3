use std::{cell::RefCell, rc::Rc, str::from_utf8};

use escrow_ledger::bin_utils::Service;

const TEST_FILE: &str = include_str!("operations.csv");

#[test]
fn process_operations() {
    let mut output = Vec::new();
    let errors = Rc::new(RefCell::new(Vec::new()));
    let collected = errors.clone();
    let service = Service {
        input: TEST_FILE.as_bytes(),
        output: &mut output,
        error_printer: Box::new(move |line, err| {
            collected.borrow_mut().push((line, err.to_string()));
        }),
    };
    service.run().unwrap();

    // balances come out sorted by entity, so the output is deterministic
    let lines: Vec<&str> = from_utf8(&output).unwrap().lines().collect();
    assert_eq!(
        lines,
        [
            "entity_type,entity,currency,available,held,total",
            "user,alice,USD,3000,2000,5000",
            "user,bob,USD,4000,0,4000",
            "user,mallory,EUR,500,0,500",
            "organization,acme,USD,2500,0,2500",
        ]
    );

    let errors = errors.borrow();
    assert_eq!(
        *errors,
        [
            (
                16,
                "Actor `mallory` may not escrow funds to themselves".to_owned()
            ),
            (
                17,
                "No earlier offer used the task reference `nowhere`".to_owned()
            ),
            (18, "Invalid amount -5: amounts must be positive".to_owned()),
            (19, "Refund needs a value in the `amount` column".to_owned()),
        ]
    );
}
