diesel::table! {
    categories (id) {
        id -> Int8,
        name -> Varchar,
    }
}

diesel::table! {
    subcategories (id) {
        id -> Int8,
        category_id -> Int8,
        name -> Varchar,
    }
}

diesel::table! {
    customers (id) {
        id -> Int8,
        name -> Varchar,
        email -> Nullable<Varchar>,
        created_at -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    stores (id) {
        id -> Int8,
        name -> Varchar,
        location -> Nullable<Varchar>,
        city -> Nullable<Varchar>,
        state -> Nullable<Varchar>,
        zip_code -> Nullable<Varchar>,
        county -> Nullable<Varchar>,
        region -> Nullable<Varchar>,
    }
}

diesel::table! {
    products (id) {
        id -> Int8,
        name -> Varchar,
        price -> Numeric,
        category_id -> Nullable<Int8>,
        subcategory_id -> Nullable<Int8>,
    }
}

diesel::table! {
    transactions (id) {
        id -> Int8,
        customer_id -> Nullable<Int8>,
        product_id -> Nullable<Int8>,
        store_id -> Nullable<Int8>,
        transaction_type -> Varchar,
        quantity -> Int4,
        unit_price -> Nullable<Numeric>,
        total_amount -> Numeric,
        transaction_date -> Timestamptz,
        status -> Varchar,
        notes -> Nullable<Text>,
        original_transaction_id -> Nullable<Int8>,
    }
}

diesel::allow_tables_to_appear_in_same_query!(
    categories,
    subcategories,
    customers,
    stores,
    products,
    transactions,
);
